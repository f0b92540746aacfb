use crate::layout::RepoLayout;
use crate::models::{Backup, Correlation, RunState};
use crate::services::archive::{ArchiveTool, ToolError};
use crate::services::events::EventBus;
use crate::services::status_cache::StatusCache;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to index {source_path}:\n{}", .error.detail())]
    Index {
        source_path: String,
        #[source]
        error: ToolError,
    },

    #[error("Failed to save:\n{}", .0.detail())]
    Save(#[source] ToolError),

    #[error(transparent)]
    Status(#[from] ToolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    NotRunnable,
    AlreadyRunning,
}

/// Exclusive claim on one backup. Released on drop.
#[derive(Debug)]
pub struct RunLease {
    backup_id: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.backup_id);
    }
}

/// Runs the index → save pipeline, at most once at a time per backup.
pub struct Runner {
    statuses: Arc<StatusCache>,
    tool: Arc<dyn ArchiveTool>,
    layout: RepoLayout,
    events: EventBus,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Runner {
    pub fn new(
        statuses: Arc<StatusCache>,
        tool: Arc<dyn ArchiveTool>,
        layout: RepoLayout,
        events: EventBus,
    ) -> Self {
        Self {
            statuses,
            tool,
            layout,
            events,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn try_lease(&self, backup_id: &str) -> Option<RunLease> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(backup_id.to_string()) {
            return None;
        }
        Some(RunLease {
            backup_id: backup_id.to_string(),
            running: self.running.clone(),
        })
    }

    /// Like [`Runner::try_lease`], publishing "already executing" on refusal.
    pub fn lease_or_report(&self, backup: &Backup, correlation: &Correlation) -> Option<RunLease> {
        let lease = self.try_lease(&backup.id);
        if lease.is_none() {
            self.events.client_error(
                format!("Backup is already currently executing: {}", backup.name),
                correlation,
            );
        }
        lease
    }

    pub fn is_running(&self, backup_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(backup_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn run(&self, backup: &Backup, correlation: &Correlation) -> Result<RunOutcome, RunError> {
        let Some(_lease) = self.lease_or_report(backup, correlation) else {
            return Ok(RunOutcome::AlreadyRunning);
        };

        let status = self.statuses.get(backup, correlation).await?;
        if !status.readiness.is_runnable() {
            self.events.client_error(
                format!(
                    "Cannot run backup {}. {}",
                    backup.name,
                    status.readiness.describe()
                ),
                correlation,
            );
            return Ok(RunOutcome::NotRunnable);
        }

        tracing::info!(backup_id = %backup.id, name = %backup.name, correlation = %correlation, "Starting backup");
        let result = self.index_and_save(backup, correlation).await;
        let cleared = self.statuses.clear_running_state(backup, correlation).await;

        match &result {
            Ok(()) => tracing::info!(backup_id = %backup.id, "Backup completed"),
            Err(e) => tracing::error!(backup_id = %backup.id, error = %e, "Backup failed"),
        }
        result?;
        cleared?;
        Ok(RunOutcome::Completed)
    }

    async fn index_and_save(&self, backup: &Backup, correlation: &Correlation) -> Result<(), RunError> {
        let repo = self.layout.repo_dir(backup);

        self.statuses
            .set_running_state(backup, RunState::Indexing, correlation)
            .await?;
        for source in &backup.sources {
            self.tool
                .index(&repo, source, backup.exclude.as_deref())
                .await
                .map_err(|error| RunError::Index {
                    source_path: source.clone(),
                    error,
                })?;
        }

        self.statuses
            .set_running_state(backup, RunState::Saving, correlation)
            .await?;
        self.tool
            .save(&repo, &backup.name, &backup.sources)
            .await
            .map_err(RunError::Save)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::archive::recording::{RecordingTool, ToolCall};
    use crate::services::events::{Event, Subscription};
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        _sources: TempDir,
        runner: Arc<Runner>,
        statuses: Arc<StatusCache>,
        tool: Arc<RecordingTool>,
        backup: Backup,
        events: Arc<Mutex<Vec<Event>>>,
        _sub: Subscription,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let tool = Arc::new(RecordingTool::new());
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let layout = RepoLayout::new(root.path());
        let backup = Backup {
            id: "b1".to_string(),
            name: "docs".to_string(),
            sources: vec![
                sources.path().join("a").to_string_lossy().into_owned(),
                sources.path().join("b").to_string_lossy().into_owned(),
            ],
            cron_line: "0 0 * * *".to_string(),
            exclude: Some("\\.cache".to_string()),
        };
        for source in &backup.sources {
            std::fs::create_dir_all(source).unwrap();
        }
        tool.init(&layout.repo_dir(&backup)).await.unwrap();
        tool.clear_calls();

        let statuses = Arc::new(StatusCache::new(tool.clone(), layout.clone(), bus.clone()));
        let runner = Arc::new(Runner::new(statuses.clone(), tool.clone(), layout, bus));
        Fixture {
            _root: root,
            _sources: sources,
            runner,
            statuses,
            tool,
            backup,
            events,
            _sub: sub,
        }
    }

    fn states(events: &Mutex<Vec<Event>>) -> Vec<RunState> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::BackupStatusChanged { status, .. } => Some(status.status),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &Mutex<Vec<Event>>) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::ClientError { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_transitions() {
        let f = fixture().await;
        let outcome = f.runner.run(&f.backup, &Correlation::new("c1")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(
            states(&f.events),
            vec![
                RunState::NeverRun,
                RunState::Indexing,
                RunState::Saving,
                RunState::Idle
            ]
        );
        let calls = f.tool.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], ToolCall::Index { exclude: Some(rx), .. } if rx == "\\.cache"));
        assert!(matches!(&calls[2], ToolCall::Save { name, .. } if name == "docs"));
        assert!(!f.runner.is_running("b1"));
    }

    #[tokio::test]
    async fn test_not_runnable_has_no_side_effects() {
        let mut f = fixture().await;
        f.backup.sources.push("/definitely/not/here".to_string());

        let outcome = f.runner.run(&f.backup, &Correlation::none()).await.unwrap();
        assert_eq!(outcome, RunOutcome::NotRunnable);
        assert!(f.tool.calls().is_empty());
        assert_eq!(f.statuses.peek("b1").unwrap().status, RunState::NeverRun);
        assert_eq!(
            errors(&f.events),
            vec!["Cannot run backup docs. sources-inaccessible: /definitely/not/here"]
        );
    }

    #[tokio::test]
    async fn test_failing_index_still_settles() {
        let f = fixture().await;
        f.tool.fail("index", "bup: permission denied");

        let err = f.runner.run(&f.backup, &Correlation::none()).await.unwrap_err();
        assert!(matches!(err, RunError::Index { .. }));
        assert!(err.to_string().contains("permission denied"));

        // Stops at the first failing source
        assert_eq!(f.tool.calls().iter().filter(|c| c.is_index_or_save()).count(), 1);
        assert_eq!(f.statuses.peek("b1").unwrap().status, RunState::NeverRun);
        assert!(!f.runner.is_running("b1"));
    }

    #[tokio::test]
    async fn test_failing_save_still_settles() {
        let f = fixture().await;
        f.tool.fail("save", "bup: disk full");

        let err = f.runner.run(&f.backup, &Correlation::none()).await.unwrap_err();
        assert!(matches!(err, RunError::Save(_)));
        assert_eq!(f.statuses.peek("b1").unwrap().status, RunState::NeverRun);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_run_is_refused() {
        let f = fixture().await;
        let gate = f.tool.hold_indexing();

        let first = {
            let runner = f.runner.clone();
            let backup = f.backup.clone();
            tokio::spawn(async move { runner.run(&backup, &Correlation::none()).await })
        };
        while !f.statuses.is_running("b1") {
            tokio::task::yield_now().await;
        }

        let second = f.runner.run(&f.backup, &Correlation::new("c2")).await.unwrap();
        assert_eq!(second, RunOutcome::AlreadyRunning);
        assert_eq!(
            errors(&f.events),
            vec!["Backup is already currently executing: docs"]
        );

        gate.add_permits(10);
        assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Completed);
        let saves = f
            .tool
            .calls()
            .iter()
            .filter(|c| matches!(c, ToolCall::Save { .. }))
            .count();
        assert_eq!(saves, 1);
    }

    #[test]
    fn test_lease_released_on_drop() {
        let tool: Arc<dyn ArchiveTool> = Arc::new(RecordingTool::new());
        let bus = EventBus::new();
        let layout = RepoLayout::new("/backups");
        let statuses = Arc::new(StatusCache::new(tool.clone(), layout.clone(), bus.clone()));
        let runner = Runner::new(statuses, tool, layout, bus);

        let lease = runner.try_lease("b1").unwrap();
        assert!(runner.try_lease("b1").is_none());
        assert_eq!(runner.running_count(), 1);
        drop(lease);
        assert!(runner.try_lease("b1").is_some());
    }
}
