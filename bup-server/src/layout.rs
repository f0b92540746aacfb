use crate::models::Backup;
use std::path::{Path, PathBuf};

/// Where each backup's bup repository and restore target live on disk.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, backup: &Backup) -> PathBuf {
        self.repo_dir_for(&backup.name)
    }

    pub fn repo_dir_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn restore_dir(&self, backup: &Backup) -> PathBuf {
        self.root.join(format!("bup_restore_{}", backup.name))
    }
}
