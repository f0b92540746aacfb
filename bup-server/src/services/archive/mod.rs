//! Adapter over the external archival tool.
//!
//! Every backup owns one repository directory. The engine only talks to it
//! through [`ArchiveTool`], so tests can swap the subprocess-backed
//! [`BupTool`] for an in-memory recorder.

pub mod bup;
#[cfg(any(test, feature = "test-util"))]
pub mod recording;

pub use bup::BupTool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{operation} failed (exit code {code:?}): {stderr}")]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unknown revision: {0}")]
    UnknownRevision(String),

    #[error("Directory {} is not empty!", .0.display())]
    NotEmpty(PathBuf),

    #[error("could not parse {operation} output: {output:?}")]
    Parse {
        operation: &'static str,
        output: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Builds the error for a non-zero exit, recognizing git's
    /// "unknown revision" (a branch with no commits yet).
    pub fn classify(operation: &'static str, code: Option<i32>, stderr: String) -> Self {
        if stderr.contains("unknown revision") {
            ToolError::UnknownRevision(stderr.trim().to_string())
        } else {
            ToolError::Failed {
                operation,
                code,
                stderr,
            }
        }
    }

    pub fn is_unknown_revision(&self) -> bool {
        matches!(self, ToolError::UnknownRevision(_))
    }

    /// The text shown to clients: captured stderr when there is any.
    pub fn detail(&self) -> String {
        match self {
            ToolError::Failed { stderr, .. } if !stderr.trim().is_empty() => {
                stderr.trim().to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Retention windows handed to `bup prune-older`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunePolicy {
    pub keep_all_for: String,
    pub keep_dailies_for: String,
    pub keep_monthlies_for: String,
    pub keep_yearlies_for: String,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            keep_all_for: "1d".into(),
            keep_dailies_for: "1w".into(),
            keep_monthlies_for: "1y".into(),
            keep_yearlies_for: "forever".into(),
        }
    }
}

#[async_trait]
pub trait ArchiveTool: Send + Sync {
    async fn init(&self, repo: &Path) -> Result<(), ToolError>;

    async fn index(&self, repo: &Path, source: &str, exclude: Option<&str>)
        -> Result<(), ToolError>;

    async fn save(&self, repo: &Path, name: &str, sources: &[String]) -> Result<(), ToolError>;

    /// Time of the newest commit on `branch`.
    async fn last_commit_time(&self, repo: &Path, branch: &str)
        -> Result<DateTime<Utc>, ToolError>;

    /// Every revision on `branch`, newest first.
    async fn revisions(&self, repo: &Path, branch: &str) -> Result<Vec<DateTime<Utc>>, ToolError>;

    async fn size_bytes(&self, repo: &Path) -> Result<u64, ToolError>;

    async fn remove_revision(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
    ) -> Result<(), ToolError>;

    async fn gc(&self, repo: &Path) -> Result<(), ToolError>;

    async fn prune_older(&self, repo: &Path, policy: &PrunePolicy) -> Result<(), ToolError>;

    /// Restores `subpath` of a revision into `out_dir`, which must be
    /// missing or empty.
    async fn restore(
        &self,
        repo: &Path,
        branch: &str,
        revision: &DateTime<Utc>,
        subpath: &str,
        out_dir: &Path,
    ) -> Result<(), ToolError>;

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<(), ToolError>;
}

/// Treats "unknown revision" as an absent value.
pub fn absent_if_unknown<T>(result: Result<T, ToolError>) -> Result<Option<T>, ToolError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unknown_revision() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Renames the branch inside `old_repo`, then moves the directory.
///
/// A branch with no commits does not exist yet, so there is nothing to rename.
pub async fn move_repository(
    tool: &dyn ArchiveTool,
    old_repo: &Path,
    new_repo: &Path,
    old_name: &str,
    new_name: &str,
) -> Result<(), ToolError> {
    tracing::info!(
        from = %old_repo.display(),
        to = %new_repo.display(),
        "Moving repository"
    );
    if absent_if_unknown(tool.last_commit_time(old_repo, old_name).await)?.is_some() {
        tool.rename_branch(old_repo, old_name, new_name).await?;
    }
    tokio::fs::rename(old_repo, new_repo).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unknown_revision() {
        let err = ToolError::classify(
            "git log",
            Some(128),
            "fatal: ambiguous argument 'docs': unknown revision or path".into(),
        );
        assert!(err.is_unknown_revision());

        let err = ToolError::classify("bup save", Some(1), "error: disk full\n".into());
        assert!(!err.is_unknown_revision());
        assert_eq!(err.detail(), "error: disk full");
    }

    #[test]
    fn test_absent_if_unknown() {
        let absent: Result<u64, _> = Err(ToolError::UnknownRevision("x".into()));
        assert_eq!(absent_if_unknown(absent).unwrap(), None);

        let failed: Result<u64, _> = Err(ToolError::classify("du", Some(1), "boom".into()));
        assert!(absent_if_unknown(failed).is_err());
    }

    #[test]
    fn test_not_empty_message() {
        let err = ToolError::NotEmpty(PathBuf::from("/backups/bup_restore_docs"));
        assert_eq!(
            err.to_string(),
            "Directory /backups/bup_restore_docs is not empty!"
        );
    }
}
