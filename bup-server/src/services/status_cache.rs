//! Per-backup status snapshots.
//!
//! Entries are built lazily from directory probes and archive queries. The
//! `status` field is owned by state transitions and survives rebuilds.

use crate::layout::RepoLayout;
use crate::models::{
    Backup, BackupStatus, Correlation, Readiness, RunState, SourceStatus, StatusPatch,
};
use crate::services::archive::{absent_if_unknown, ArchiveTool, ToolError};
use crate::services::events::EventBus;
use crate::utils::fs::is_accessible_dir;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::path::Path;
use std::sync::Arc;

pub struct StatusCache {
    entries: DashMap<String, BackupStatus>,
    tool: Arc<dyn ArchiveTool>,
    layout: RepoLayout,
    events: EventBus,
}

impl StatusCache {
    pub fn new(tool: Arc<dyn ArchiveTool>, layout: RepoLayout, events: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            tool,
            layout,
            events,
        }
    }

    /// Cached entry without building one.
    pub fn peek(&self, backup_id: &str) -> Option<BackupStatus> {
        self.entries.get(backup_id).map(|e| e.value().clone())
    }

    pub fn is_running(&self, backup_id: &str) -> bool {
        self.entries
            .get(backup_id)
            .map(|e| e.status.is_running())
            .unwrap_or(false)
    }

    pub async fn get(
        &self,
        backup: &Backup,
        correlation: &Correlation,
    ) -> Result<BackupStatus, ToolError> {
        if let Some(status) = self.peek(&backup.id) {
            return Ok(status);
        }

        let status = self.rebuild(backup).await?;
        // A concurrent caller may have built one first
        let status = self
            .entries
            .entry(backup.id.clone())
            .or_insert(status)
            .value()
            .clone();
        self.events.status_changed(status.clone(), correlation);
        Ok(status)
    }

    pub async fn recompute(
        &self,
        backup: &Backup,
        correlation: &Correlation,
    ) -> Result<BackupStatus, ToolError> {
        let fresh = self.rebuild(backup).await?;
        let status = self.store(&backup.id, fresh);
        self.events.status_changed(status.clone(), correlation);
        Ok(status)
    }

    /// Moves a backup into `indexing` or `saving`.
    pub async fn set_running_state(
        &self,
        backup: &Backup,
        state: RunState,
        correlation: &Correlation,
    ) -> Result<BackupStatus, ToolError> {
        self.get(backup, correlation).await?;
        self.set_status(backup, StatusPatch::status(state), correlation)
            .await
    }

    /// Settles a backup back to `idle` or `never-run` and refreshes it.
    ///
    /// A backup forgotten while it was running stays forgotten: the settled
    /// status is returned but neither cached nor published.
    pub async fn clear_running_state(
        &self,
        backup: &Backup,
        correlation: &Correlation,
    ) -> Result<BackupStatus, ToolError> {
        match self.rebuild(backup).await {
            Ok(mut fresh) => {
                fresh.status = RunState::settled(fresh.last_run.as_ref());
                let settled = self.entries.get_mut(&backup.id).map(|mut entry| {
                    *entry = fresh.clone();
                    entry.clone()
                });
                match settled {
                    Some(status) => {
                        self.events.status_changed(status.clone(), correlation);
                        Ok(status)
                    }
                    None => {
                        tracing::debug!(backup_id = %backup.id, "Not caching status of forgotten backup");
                        Ok(fresh)
                    }
                }
            }
            Err(e) => {
                let provisional = self.entries.get_mut(&backup.id).map(|mut entry| {
                    entry.status = RunState::settled(entry.last_run.as_ref());
                    entry.clone()
                });
                if let Some(status) = provisional {
                    self.events.status_changed(status, correlation);
                }
                Err(e)
            }
        }
    }

    /// Shallow-merges `patch` into the entry, building it first if needed.
    pub async fn set_status(
        &self,
        backup: &Backup,
        patch: StatusPatch,
        correlation: &Correlation,
    ) -> Result<BackupStatus, ToolError> {
        if !self.entries.contains_key(&backup.id) {
            self.get(backup, correlation).await?;
        }

        let patched = self.entries.get_mut(&backup.id).map(|mut entry| {
            entry.apply(patch.clone());
            entry.clone()
        });
        match patched {
            Some(status) => {
                self.events.status_changed(status.clone(), correlation);
                Ok(status)
            }
            None => {
                // Forgotten between the build and the patch
                let mut status = self.rebuild(backup).await?;
                status.apply(patch);
                Ok(status)
            }
        }
    }

    pub fn forget(&self, backup_id: &str) {
        self.entries.remove(backup_id);
    }

    /// Replaces the entry, keeping the previous run state.
    fn store(&self, backup_id: &str, mut fresh: BackupStatus) -> BackupStatus {
        let mut entry = self
            .entries
            .entry(backup_id.to_string())
            .or_insert_with(|| fresh.clone());
        fresh.status = entry.status;
        *entry = fresh;
        entry.clone()
    }

    async fn rebuild(&self, backup: &Backup) -> Result<BackupStatus, ToolError> {
        let repo = self.layout.repo_dir(backup);
        let repo_accessible = is_accessible_dir(&repo).await;
        let source_status = join_all(backup.sources.iter().map(|source| async move {
            SourceStatus {
                source: source.clone(),
                accessible: is_accessible_dir(Path::new(source)).await,
            }
        }))
        .await;

        let (last_run, branch_size) = if repo_accessible {
            (
                absent_if_unknown(self.tool.last_commit_time(&repo, &backup.name).await)?,
                absent_if_unknown(self.tool.size_bytes(&repo).await)?,
            )
        } else {
            (None, None)
        };

        let readiness = Readiness::evaluate(repo_accessible, &source_status);
        let status = self
            .entries
            .get(&backup.id)
            .map(|e| e.status)
            .unwrap_or_else(|| RunState::settled(last_run.as_ref()));

        Ok(BackupStatus {
            backup_id: backup.id.clone(),
            repo_accessible,
            source_status,
            readiness,
            last_run,
            branch_size,
            status,
        })
    }
}
