use crate::config::AppConfig;
use crate::layout::RepoLayout;
use crate::services::archive::ArchiveTool;
use crate::services::config_store::ConfigStore;
use crate::services::events::EventBus;
use crate::services::runner::Runner;
use crate::services::status_cache::StatusCache;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub config: AppConfig,
    pub layout: RepoLayout,
    pub events: EventBus,
    pub store: Arc<ConfigStore>,
    pub statuses: Arc<StatusCache>,
    pub runner: Arc<Runner>,
    pub tool: Arc<dyn ArchiveTool>,
    /// Serializes read-modify-write cycles on the config.
    pub edits: Mutex<()>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, tool: Arc<dyn ArchiveTool>) -> Self {
        let layout = RepoLayout::new(&config.backups_dir);
        let events = EventBus::new();
        let store = Arc::new(ConfigStore::new(config.config_file(), &config.backups_dir));
        let statuses = Arc::new(StatusCache::new(tool.clone(), layout.clone(), events.clone()));
        let runner = Arc::new(Runner::new(
            statuses.clone(),
            tool.clone(),
            layout.clone(),
            events.clone(),
        ));

        Self {
            config,
            layout,
            events,
            store,
            statuses,
            runner,
            tool,
            edits: Mutex::new(()),
            started_at: Instant::now(),
        }
    }
}
