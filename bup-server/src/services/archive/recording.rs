//! In-memory [`ArchiveTool`] that records what the engine asked for.

use super::{ArchiveTool, PrunePolicy, ToolError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Init(PathBuf),
    Index {
        repo: PathBuf,
        source: String,
        exclude: Option<String>,
    },
    Save {
        repo: PathBuf,
        name: String,
        sources: Vec<String>,
    },
    RemoveRevision {
        repo: PathBuf,
        branch: String,
        revision: DateTime<Utc>,
    },
    Gc(PathBuf),
    Prune(PathBuf),
    Restore {
        repo: PathBuf,
        branch: String,
        revision: DateTime<Utc>,
        subpath: String,
        out_dir: PathBuf,
    },
    RenameBranch {
        repo: PathBuf,
        old: String,
        new: String,
    },
}

impl ToolCall {
    pub fn is_index_or_save(&self) -> bool {
        matches!(self, ToolCall::Index { .. } | ToolCall::Save { .. })
    }
}

#[derive(Default)]
pub struct RecordingTool {
    calls: Mutex<Vec<ToolCall>>,
    branches: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    failures: Mutex<HashMap<&'static str, String>>,
    index_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Makes `operation` fail with `stderr` until [`RecordingTool::succeed`].
    ///
    /// Operation names: `init`, `index`, `save`, `last_commit_time`,
    /// `revisions`, `size_bytes`, `remove_revision`, `gc`, `prune_older`,
    /// `restore`, `rename_branch`.
    pub fn fail(&self, operation: &'static str, stderr: &str) {
        lock(&self.failures).insert(operation, stderr.to_string());
    }

    pub fn succeed(&self, operation: &'static str) {
        lock(&self.failures).remove(operation);
    }

    pub fn seed_revisions(&self, branch: &str, revisions: Vec<DateTime<Utc>>) {
        lock(&self.branches).insert(branch.to_string(), revisions);
    }

    /// Blocks every `index` call until the returned semaphore gets a permit.
    pub fn hold_indexing(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.index_gate) = Some(gate.clone());
        gate
    }

    fn record(&self, call: ToolCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self, operation: &'static str) -> Result<(), ToolError> {
        match lock(&self.failures).get(operation) {
            Some(stderr) => Err(ToolError::classify(operation, Some(1), stderr.clone())),
            None => Ok(()),
        }
    }

    fn branch(&self, branch: &str) -> Result<Vec<DateTime<Utc>>, ToolError> {
        match lock(&self.branches).get(branch) {
            Some(revisions) if !revisions.is_empty() => Ok(revisions.clone()),
            _ => Err(ToolError::UnknownRevision(branch.to_string())),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ArchiveTool for RecordingTool {
    async fn init(&self, repo: &Path) -> Result<(), ToolError> {
        self.record(ToolCall::Init(repo.to_path_buf()));
        self.check("init")?;
        tokio::fs::create_dir_all(repo).await?;
        Ok(())
    }

    async fn index(&self, repo: &Path, source: &str, exclude: Option<&str>) -> Result<(), ToolError> {
        self.record(ToolCall::Index {
            repo: repo.to_path_buf(),
            source: source.to_string(),
            exclude: exclude.map(str::to_string),
        });
        let gate = lock(&self.index_gate).clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        self.check("index")
    }

    async fn save(&self, repo: &Path, name: &str, sources: &[String]) -> Result<(), ToolError> {
        self.record(ToolCall::Save {
            repo: repo.to_path_buf(),
            name: name.to_string(),
            sources: sources.to_vec(),
        });
        self.check("save")?;

        let mut branches = lock(&self.branches);
        let revisions = branches.entry(name.to_string()).or_default();
        let now = Utc::now()
            .duration_trunc(Duration::seconds(1))
            .unwrap_or_else(|_| Utc::now());
        let revision = match revisions.first() {
            Some(newest) if *newest >= now => *newest + Duration::seconds(1),
            _ => now,
        };
        revisions.insert(0, revision);
        Ok(())
    }

    async fn last_commit_time(&self, _repo: &Path, branch: &str) -> Result<DateTime<Utc>, ToolError> {
        self.check("last_commit_time")?;
        Ok(self.branch(branch)?[0])
    }

    async fn revisions(&self, _repo: &Path, branch: &str) -> Result<Vec<DateTime<Utc>>, ToolError> {
        self.check("revisions")?;
        self.branch(branch)
    }

    async fn size_bytes(&self, repo: &Path) -> Result<u64, ToolError> {
        self.check("size_bytes")?;
        let saves = lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, ToolCall::Save { repo: r, .. } if r == repo))
            .count() as u64;
        Ok(4096 + 1024 * saves)
    }

    async fn remove_revision(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
    ) -> Result<(), ToolError> {
        self.record(ToolCall::RemoveRevision {
            repo: repo.to_path_buf(),
            branch: branch.to_string(),
            revision: *revision,
        });
        self.check("remove_revision")?;
        if let Some(revisions) = lock(&self.branches).get_mut(branch) {
            revisions.retain(|r| r != revision);
        }
        Ok(())
    }

    async fn gc(&self, repo: &Path) -> Result<(), ToolError> {
        self.record(ToolCall::Gc(repo.to_path_buf()));
        self.check("gc")
    }

    async fn prune_older(&self, repo: &Path, _policy: &PrunePolicy) -> Result<(), ToolError> {
        self.record(ToolCall::Prune(repo.to_path_buf()));
        self.check("prune_older")
    }

    async fn restore(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
        subpath: &str,
        out_dir: &Path,
    ) -> Result<(), ToolError> {
        self.record(ToolCall::Restore {
            repo: repo.to_path_buf(),
            branch: branch.to_string(),
            revision: *revision,
            subpath: subpath.to_string(),
            out_dir: out_dir.to_path_buf(),
        });
        if !crate::utils::fs::is_missing_or_empty(out_dir).await? {
            return Err(ToolError::NotEmpty(out_dir.to_path_buf()));
        }
        self.check("restore")?;
        tokio::fs::create_dir_all(out_dir).await?;
        Ok(())
    }

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<(), ToolError> {
        self.record(ToolCall::RenameBranch {
            repo: repo.to_path_buf(),
            old: old.to_string(),
            new: new.to_string(),
        });
        self.check("rename_branch")?;
        let mut branches = lock(&self.branches);
        if let Some(revisions) = branches.remove(old) {
            branches.insert(new.to_string(), revisions);
        }
        Ok(())
    }
}
