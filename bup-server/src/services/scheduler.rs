//! One cron timer per backup, kept in sync with the config.

use crate::models::{Config, Correlation};
use crate::services::config_store::ConfigStore;
use crate::services::events::{Event, EventBus};
use crate::services::runner::Runner;
use crate::services::status_cache::StatusCache;
use crate::utils::cron;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Done = Shared<BoxFuture<'static, ()>>;

struct ScheduledTask {
    timer: Uuid,
    cron_line: String,
    /// Resolves once every execution triggered so far has finished.
    done: Done,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub rebuilt: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Started,
    Deleted,
    Stale,
    AlreadyRunning,
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    config: Arc<ConfigStore>,
    statuses: Arc<StatusCache>,
    runner: Arc<Runner>,
    events: EventBus,
    me: Weak<BackupScheduler>,
}

fn resolved() -> Done {
    futures_util::future::ready(()).boxed().shared()
}

impl BackupScheduler {
    pub async fn new(
        config: Arc<ConfigStore>,
        statuses: Arc<StatusCache>,
        runner: Arc<Runner>,
        events: EventBus,
    ) -> anyhow::Result<Arc<Self>> {
        let scheduler = JobScheduler::new().await?;
        Ok(Arc::new_cyclic(|me| Self {
            scheduler: Mutex::new(scheduler),
            tasks: Mutex::new(HashMap::new()),
            config,
            statuses,
            runner,
            events,
            me: me.clone(),
        }))
    }

    /// Brings the timers in line with `config`. Idempotent.
    pub async fn reconcile(&self, config: &Config) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut tasks = self.tasks.lock().await;
        let scheduler = self.scheduler.lock().await;

        for backup in &config.backups {
            if let Some(task) = tasks.get(&backup.id) {
                if task.cron_line == backup.cron_line {
                    report.unchanged.push(backup.id.clone());
                    continue;
                }
            }

            let expression = match cron::validate(&backup.cron_line) {
                Ok(expression) => expression,
                Err(e) => {
                    tracing::error!(backup_id = %backup.id, cron = %backup.cron_line, "Invalid cron line: {}", e);
                    continue;
                }
            };

            let timer = match self.timer_job(&backup.id, &backup.name, &expression) {
                Ok(job) => match scheduler.add(job).await {
                    Ok(timer) => timer,
                    Err(e) => {
                        tracing::error!(backup_id = %backup.id, error = %e, "Failed to schedule backup");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::error!(backup_id = %backup.id, error = %e, "Failed to build cron job");
                    continue;
                }
            };

            let done = match tasks.remove(&backup.id) {
                Some(old) => {
                    tracing::info!(backup_id = %backup.id, name = %backup.name, cron = %backup.cron_line, "Rebuilding cron handler");
                    if let Err(e) = scheduler.remove(&old.timer).await {
                        tracing::warn!(backup_id = %backup.id, error = %e, "Failed to stop old timer");
                    }
                    report.rebuilt.push(backup.id.clone());
                    old.done
                }
                None => {
                    tracing::info!(backup_id = %backup.id, name = %backup.name, cron = %backup.cron_line, "Adding cron handler");
                    report.added.push(backup.id.clone());
                    resolved()
                }
            };

            tasks.insert(
                backup.id.clone(),
                ScheduledTask {
                    timer,
                    cron_line: backup.cron_line.clone(),
                    done,
                },
            );
        }

        let live: HashSet<&str> = config.backups.iter().map(|b| b.id.as_str()).collect();
        let gone: Vec<String> = tasks
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(task) = tasks.remove(&id) {
                tracing::info!(backup_id = %id, "Stopping cron handler for removed backup");
                if let Err(e) = scheduler.remove(&task.timer).await {
                    tracing::warn!(backup_id = %id, error = %e, "Failed to stop timer");
                }
                report.removed.push(id);
            }
        }

        report
    }

    fn timer_job(&self, backup_id: &str, name: &str, expression: &str) -> anyhow::Result<Job> {
        let me = self.me.clone();
        let backup_id = backup_id.to_string();
        let name = name.to_string();

        let job = Job::new_async(expression, move |uuid, _lock| {
            let me = me.clone();
            let backup_id = backup_id.clone();
            let name = name.clone();
            Box::pin(async move {
                tracing::info!(backup_id = %backup_id, name = %name, "Cron schedule fired");
                if let Some(me) = me.upgrade() {
                    me.fire(&backup_id, &name, Some(uuid)).await;
                }
            })
        })?;
        Ok(job)
    }

    /// Chains a run onto the backup's task. `timer` is the firing timer, if any.
    pub async fn fire(&self, backup_id: &str, name: &str, timer: Option<Uuid>) -> FireOutcome {
        let config = self.config.get().await;
        let mut tasks = self.tasks.lock().await;

        let backup = config.find(backup_id).cloned();
        let (task, backup) = match (tasks.get_mut(backup_id), backup) {
            (Some(task), Some(backup)) => (task, backup),
            _ => {
                self.events
                    .client_error(format!("Backup was deleted: {name}"), &Correlation::none());
                return FireOutcome::Deleted;
            }
        };

        if let Some(timer) = timer {
            if timer != task.timer {
                tracing::debug!(backup_id, %timer, "Ignoring stale timer");
                return FireOutcome::Stale;
            }
        }

        if self.statuses.is_running(backup_id) {
            self.events.client_error(
                format!("Backup is already currently executing: {}", backup.name),
                &Correlation::none(),
            );
            return FireOutcome::AlreadyRunning;
        }

        let previous = task.done.clone();
        let runner = self.runner.clone();
        let events = self.events.clone();
        let execution = async move {
            previous.await;
            tracing::info!(backup_id = %backup.id, name = %backup.name, "Starting scheduled execution");
            if let Err(e) = runner.run(&backup, &Correlation::none()).await {
                events.client_error(e.to_string(), &Correlation::none());
            }
            tracing::info!(backup_id = %backup.id, name = %backup.name, "Finished scheduled execution");
        }
        .boxed()
        .shared();

        task.done = execution.clone();
        tokio::spawn(execution);
        FireOutcome::Started
    }

    /// Waits for every execution chained on `backup_id` so far.
    pub async fn wait_idle(&self, backup_id: &str) {
        let done = self
            .tasks
            .lock()
            .await
            .get(backup_id)
            .map(|t| t.done.clone());
        if let Some(done) = done {
            done.await;
        }
    }

    /// The timer currently driving `backup_id`, if it is scheduled.
    pub async fn timer_id(&self, backup_id: &str) -> Option<Uuid> {
        self.tasks.lock().await.get(backup_id).map(|t| t.timer)
    }

    pub async fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconciles whenever the config changes, until cancelled.
    pub fn watch_config(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let changed = Arc::new(Notify::new());
        let notify = changed.clone();
        let subscription = self.events.subscribe(move |event| {
            if matches!(event, Event::ConfigChanged { .. }) {
                notify.notify_one();
            }
        });

        let me = self.clone();
        tokio::spawn(async move {
            let _subscription = subscription;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = changed.notified() => {
                        let config = me.config.get().await;
                        let report = me.reconcile(&config).await;
                        tracing::debug!(?report, "Schedules reconciled");
                    }
                }
            }
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RepoLayout;
    use crate::models::{Backup, RunState};
    use crate::services::archive::recording::{RecordingTool, ToolCall};
    use crate::services::archive::ArchiveTool;
    use crate::services::events::Subscription;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        _config_dir: TempDir,
        sources: TempDir,
        scheduler: Arc<BackupScheduler>,
        store: Arc<ConfigStore>,
        tool: Arc<RecordingTool>,
        layout: RepoLayout,
        statuses: Arc<StatusCache>,
        events: Arc<StdMutex<Vec<Event>>>,
        _sub: Subscription,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let tool = Arc::new(RecordingTool::new());
        let bus = EventBus::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let layout = RepoLayout::new(root.path());
        let store = Arc::new(ConfigStore::new(
            config_dir.path().join("config.json"),
            root.path(),
        ));
        let statuses = Arc::new(StatusCache::new(tool.clone(), layout.clone(), bus.clone()));
        let runner = Arc::new(Runner::new(
            statuses.clone(),
            tool.clone(),
            layout.clone(),
            bus.clone(),
        ));
        let scheduler = BackupScheduler::new(store.clone(), statuses.clone(), runner, bus)
            .await
            .unwrap();

        Fixture {
            _root: root,
            _config_dir: config_dir,
            sources,
            scheduler,
            store,
            tool,
            layout,
            statuses,
            events,
            _sub: sub,
        }
    }

    impl Fixture {
        async fn backup(&self, id: &str, name: &str, cron_line: &str) -> Backup {
            let backup = Backup {
                id: id.to_string(),
                name: name.to_string(),
                sources: vec![self.sources.path().to_string_lossy().into_owned()],
                cron_line: cron_line.to_string(),
                exclude: None,
            };
            self.tool.init(&self.layout.repo_dir(&backup)).await.unwrap();
            backup
        }

        async fn set(&self, backups: Vec<Backup>) -> Config {
            let mut config = self.store.get().await;
            config.backups = backups;
            self.store.set(config).await.unwrap()
        }

        fn errors(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    Event::ClientError { message, .. } => Some(message.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_diffs_by_cron_line() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let music = f.backup("2", "music", "0 1 * * *").await;
        let config = f.set(vec![docs.clone(), music.clone()]).await;

        let report = f.scheduler.reconcile(&config).await;
        assert_eq!(report.added, vec!["1", "2"]);

        let report = f.scheduler.reconcile(&config).await;
        assert_eq!(report.unchanged, vec!["1", "2"]);
        assert!(report.added.is_empty() && report.rebuilt.is_empty());

        let mut edited = docs.clone();
        edited.cron_line = "30 2 * * *".to_string();
        let config = f.set(vec![edited]).await;
        let report = f.scheduler.reconcile(&config).await;
        assert_eq!(report.rebuilt, vec!["1"]);
        assert_eq!(report.removed, vec!["2"]);
        assert_eq!(f.scheduler.scheduled_ids().await, vec!["1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sunday_schedules_get_a_timer() {
        let f = fixture().await;
        let weekly = f.backup("1", "weekly", "0 3 * * 0").await;
        let weekend = f.backup("2", "weekend", "0 3 * * 6-7").await;
        weekly.validate().unwrap();
        weekend.validate().unwrap();
        let config = f.set(vec![weekly, weekend]).await;

        let report = f.scheduler.reconcile(&config).await;
        assert_eq!(report.added, vec!["1", "2"]);
        assert_eq!(f.scheduler.scheduled_ids().await, vec!["1", "2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rebuilt_timer_waits_for_running_execution() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let config = f.set(vec![docs.clone()]).await;
        f.scheduler.reconcile(&config).await;
        let old_timer = f.scheduler.timer_id("1").await.unwrap();
        let gate = f.tool.hold_indexing();

        assert_eq!(
            f.scheduler.fire("1", "docs", Some(old_timer)).await,
            FireOutcome::Started
        );
        while !f.statuses.is_running("1") {
            tokio::task::yield_now().await;
        }

        let mut edited = docs;
        edited.cron_line = "30 2 * * *".to_string();
        let config = f.set(vec![edited]).await;
        assert_eq!(f.scheduler.reconcile(&config).await.rebuilt, vec!["1"]);
        assert_ne!(f.scheduler.timer_id("1").await, Some(old_timer));

        assert_eq!(
            f.scheduler.fire("1", "docs", Some(old_timer)).await,
            FireOutcome::Stale
        );

        // The rebuilt task's chain still includes the gated execution
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            f.scheduler.wait_idle("1"),
        )
        .await;
        assert!(early.is_err());
        assert!(f.statuses.is_running("1"));

        gate.add_permits(10);
        tokio::time::timeout(std::time::Duration::from_secs(5), f.scheduler.wait_idle("1"))
            .await
            .unwrap();
        assert_eq!(f.statuses.peek("1").unwrap().status, RunState::Idle);
        let saves = f
            .tool
            .calls()
            .iter()
            .filter(|c| matches!(c, ToolCall::Save { .. }))
            .count();
        assert_eq!(saves, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fire_runs_backup() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let config = f.set(vec![docs.clone()]).await;
        f.scheduler.reconcile(&config).await;

        assert_eq!(f.scheduler.fire("1", "docs", None).await, FireOutcome::Started);
        f.scheduler.wait_idle("1").await;

        assert_eq!(f.statuses.peek("1").unwrap().status, RunState::Idle);
        assert!(f
            .tool
            .calls()
            .iter()
            .any(|c| matches!(c, ToolCall::Save { name, .. } if name == "docs")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fire_for_deleted_backup_reports() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let config = f.set(vec![docs]).await;
        f.scheduler.reconcile(&config).await;

        let config = f.set(vec![]).await;
        f.scheduler.reconcile(&config).await;

        assert_eq!(f.scheduler.fire("1", "docs", None).await, FireOutcome::Deleted);
        assert_eq!(f.errors(), vec!["Backup was deleted: docs"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_timer_is_ignored() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let config = f.set(vec![docs]).await;
        f.scheduler.reconcile(&config).await;

        let outcome = f.scheduler.fire("1", "docs", Some(Uuid::new_v4())).await;
        assert_eq!(outcome, FireOutcome::Stale);
        assert!(f.tool.calls().iter().all(|c| !c.is_index_or_save()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fire_while_running_is_refused() {
        let f = fixture().await;
        let docs = f.backup("1", "docs", "0 0 * * *").await;
        let config = f.set(vec![docs]).await;
        f.scheduler.reconcile(&config).await;
        let gate = f.tool.hold_indexing();

        assert_eq!(f.scheduler.fire("1", "docs", None).await, FireOutcome::Started);
        while !f.statuses.is_running("1") {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            f.scheduler.fire("1", "docs", None).await,
            FireOutcome::AlreadyRunning
        );
        assert_eq!(f.errors(), vec!["Backup is already currently executing: docs"]);

        gate.add_permits(10);
        f.scheduler.wait_idle("1").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_config_reconciles_on_change() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let handle = f.scheduler.watch_config(cancel.clone());

        let docs = f.backup("1", "docs", "0 0 * * *").await;
        f.set(vec![docs]).await;
        f.scheduler.events.config_changed(&Correlation::none());

        for _ in 0..200 {
            if !f.scheduler.scheduled_ids().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.scheduler.scheduled_ids().await, vec!["1"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
