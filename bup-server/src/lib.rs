pub mod config;
pub mod error;
pub mod layout;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod ws;

use crate::services::scheduler::BackupScheduler;
use crate::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loads the config, schedules every backup and keeps the timers in sync
/// with later config changes until `cancel` fires.
pub async fn start_engine(
    state: &Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<Arc<BackupScheduler>> {
    let scheduler = BackupScheduler::new(
        state.store.clone(),
        state.statuses.clone(),
        state.runner.clone(),
        state.events.clone(),
    )
    .await?;

    let config = state.store.get().await;
    let report = scheduler.reconcile(&config).await;
    tracing::info!(count = report.added.len(), "Cron schedules initialized");

    scheduler.start().await?;
    scheduler.watch_config(cancel);
    Ok(scheduler)
}
