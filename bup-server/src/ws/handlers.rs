//! One handler per client command.
//!
//! Direct replies go through the [`Responder`]; anything other sessions must
//! see goes through the event bus with the command's correlation.

use super::protocol::{ClientCommand, ServerMessage};
use super::session::Responder;
use crate::error::AppError;
use crate::models::{Backup, RunState, StatusPatch};
use crate::services::archive::{absent_if_unknown, move_repository, PrunePolicy, ToolError};
use crate::state::AppState;
use chrono::{DateTime, SecondsFormat, Utc};

pub async fn dispatch(state: &AppState, command: ClientCommand, reply: &Responder) {
    let name = command.name();
    tracing::debug!(command = name, correlation = %reply.correlation(), "Handling command");
    if let Err(e) = handle(state, command, reply).await {
        tracing::warn!(command = name, correlation = %reply.correlation(), "Command failed: {}", e);
        reply.error(e.client_message());
    }
}

async fn handle(state: &AppState, command: ClientCommand, reply: &Responder) -> Result<(), AppError> {
    match command {
        ClientCommand::GetConfig => {
            reply.send(ServerMessage::Config {
                config: state.store.get().await,
            });
            Ok(())
        }
        ClientCommand::GetBackupStatus { id } => get_backup_status(state, &id, reply).await,
        ClientCommand::AddBackup { backup } => add_backup(state, backup, reply).await,
        ClientCommand::RemoveBackup { id } => remove_backup(state, &id, reply).await,
        ClientCommand::EditBackup { backup } => edit_backup(state, backup, reply).await,
        ClientCommand::RunNow { id } => run_now(state, &id, reply).await,
        ClientCommand::GetRevisions { id } => {
            let backup = find_backup(state, &id).await?;
            send_revisions(state, &backup, reply).await
        }
        ClientCommand::RemoveRevision { id, revision } => {
            remove_revision(state, &id, revision, reply).await
        }
        ClientCommand::Gc { id, all } => maintain(state, id, all, Maintenance::Gc, reply).await,
        ClientCommand::Prune { id, all } => {
            maintain(state, id, all, Maintenance::Prune, reply).await
        }
        ClientCommand::Restore {
            id,
            revision,
            subpath,
        } => restore(state, &id, revision, subpath.as_deref().unwrap_or(""), reply).await,
    }
}

async fn find_backup(state: &AppState, id: &str) -> Result<Backup, AppError> {
    state
        .store
        .get()
        .await
        .find(id)
        .cloned()
        .ok_or_else(|| AppError::precondition(format!("Backup with id {id} does not exist")))
}

async fn revisions(state: &AppState, backup: &Backup) -> Result<Vec<DateTime<Utc>>, AppError> {
    let repo = state.layout.repo_dir(backup);
    let revisions = absent_if_unknown(state.tool.revisions(&repo, &backup.name).await)?;
    Ok(revisions.unwrap_or_default())
}

async fn send_revisions(state: &AppState, backup: &Backup, reply: &Responder) -> Result<(), AppError> {
    let revisions = revisions(state, backup).await?;
    reply.send(ServerMessage::BackupRevisions {
        id: backup.id.clone(),
        revisions,
    });
    Ok(())
}

async fn require_revision(
    state: &AppState,
    backup: &Backup,
    revision: &DateTime<Utc>,
) -> Result<(), AppError> {
    if revisions(state, backup).await?.contains(revision) {
        Ok(())
    } else {
        Err(AppError::precondition(format!(
            "Revision {} does not exist",
            revision.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )))
    }
}

/// Returns a backup to its resting state after a maintenance operation.
async fn settle(state: &AppState, backup: &Backup, reply: &Responder) {
    if let Err(e) = state
        .statuses
        .clear_running_state(backup, reply.correlation())
        .await
    {
        tracing::error!(backup_id = %backup.id, "Failed to refresh status: {}", e);
    }
}

async fn get_backup_status(state: &AppState, id: &str, reply: &Responder) -> Result<(), AppError> {
    let backup = find_backup(state, id).await?;
    match state.statuses.peek(&backup.id) {
        Some(status) => state.events.status_changed(status, reply.correlation()),
        // A fresh entry is published as it is built
        None => {
            state.statuses.get(&backup, reply.correlation()).await?;
        }
    }
    Ok(())
}

async fn add_backup(state: &AppState, mut backup: Backup, reply: &Responder) -> Result<(), AppError> {
    if backup.id.trim().is_empty() {
        backup.id = uuid::Uuid::new_v4().to_string();
    }
    backup.validate().map_err(AppError::Validation)?;

    let _edit = state.edits.lock().await;
    let config = state.store.get().await;
    if config.find(&backup.id).is_some() {
        return Err(AppError::validation(format!(
            "Backup with id {} already exists",
            backup.id
        )));
    }
    if config.name_taken(&backup.name, None) {
        return Err(AppError::validation(format!("{} already exists", backup.name)));
    }

    state.tool.init(&state.layout.repo_dir(&backup)).await?;
    tracing::info!(backup_id = %backup.id, name = %backup.name, "Adding backup");
    state.store.set(config.with_backup(backup)).await?;
    state.events.config_changed(reply.correlation());
    Ok(())
}

async fn remove_backup(state: &AppState, id: &str, reply: &Responder) -> Result<(), AppError> {
    let _edit = state.edits.lock().await;
    let backup = find_backup(state, id).await?;

    tracing::info!(backup_id = %backup.id, name = %backup.name, "Removing backup");
    let config = state.store.get().await;
    state.store.set(config.without_backup(&backup.id)).await?;
    state.statuses.forget(&backup.id);
    state.events.config_changed(reply.correlation());
    Ok(())
}

async fn edit_backup(state: &AppState, backup: Backup, reply: &Responder) -> Result<(), AppError> {
    let _edit = state.edits.lock().await;
    let existing = find_backup(state, &backup.id).await?;
    let config = state.store.get().await;

    if config.name_taken(&backup.name, Some(&backup.id)) {
        return Err(AppError::validation(format!(
            "Backup with name {} already exists",
            backup.name
        )));
    }
    backup.validate().map_err(AppError::Validation)?;

    if backup.name != existing.name {
        let Some(_lease) = state.runner.try_lease(&backup.id) else {
            return Err(AppError::precondition(format!(
                "Cannot rename {} while it is running",
                existing.name
            )));
        };
        move_repository(
            state.tool.as_ref(),
            &state.layout.repo_dir(&existing),
            &state.layout.repo_dir(&backup),
            &existing.name,
            &backup.name,
        )
        .await?;
    }

    tracing::info!(backup_id = %backup.id, name = %backup.name, "Updating backup");
    state.store.set(config.with_backup(backup.clone())).await?;
    state.statuses.recompute(&backup, reply.correlation()).await?;
    state.events.config_changed(reply.correlation());
    Ok(())
}

async fn run_now(state: &AppState, id: &str, reply: &Responder) -> Result<(), AppError> {
    let backup = find_backup(state, id).await?;
    let outcome = state.runner.run(&backup, reply.correlation()).await?;
    tracing::debug!(backup_id = %backup.id, ?outcome, "Run finished");
    send_revisions(state, &backup, reply).await
}

async fn remove_revision(
    state: &AppState,
    id: &str,
    revision: DateTime<Utc>,
    reply: &Responder,
) -> Result<(), AppError> {
    let backup = find_backup(state, id).await?;
    require_revision(state, &backup, &revision).await?;
    let Some(_lease) = state.runner.lease_or_report(&backup, reply.correlation()) else {
        return Ok(());
    };

    let result = async {
        state
            .statuses
            .set_status(&backup, StatusPatch::status(RunState::Working), reply.correlation())
            .await?;
        let repo = state.layout.repo_dir(&backup);
        state
            .tool
            .remove_revision(&repo, &backup.name, &revision)
            .await?;
        state.tool.gc(&repo).await?;
        send_revisions(state, &backup, reply).await
    }
    .await;

    settle(state, &backup, reply).await;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Maintenance {
    Gc,
    Prune,
}

impl Maintenance {
    fn verb(self) -> &'static str {
        match self {
            Maintenance::Gc => "gc",
            Maintenance::Prune => "prune",
        }
    }
}

async fn maintain(
    state: &AppState,
    id: Option<String>,
    all: bool,
    operation: Maintenance,
    reply: &Responder,
) -> Result<(), AppError> {
    let backups = match (all, id) {
        (true, _) => state.store.get().await.backups,
        (false, Some(id)) => vec![find_backup(state, &id).await?],
        (false, None) => {
            return Err(AppError::validation("Either id or all is required"));
        }
    };

    for backup in backups {
        let Some(_lease) = state.runner.lease_or_report(&backup, reply.correlation()) else {
            continue;
        };
        if let Err(e) = state
            .statuses
            .set_status(&backup, StatusPatch::status(RunState::Working), reply.correlation())
            .await
        {
            reply.error(AppError::from(e).client_message());
            continue;
        }

        let repo = state.layout.repo_dir(&backup);
        let result = match operation {
            Maintenance::Gc => state.tool.gc(&repo).await,
            Maintenance::Prune => state.tool.prune_older(&repo, &PrunePolicy::default()).await,
        };
        if let Err(e) = result {
            tracing::error!(backup_id = %backup.id, ?operation, "Maintenance failed: {}", e);
            reply.error(format!(
                "Failed to {} {}:\n{}",
                operation.verb(),
                backup.name,
                e.detail()
            ));
        }

        if operation == Maintenance::Prune {
            if let Err(e) = send_revisions(state, &backup, reply).await {
                reply.error(e.client_message());
            }
        }
        settle(state, &backup, reply).await;
    }
    Ok(())
}

async fn restore(
    state: &AppState,
    id: &str,
    revision: DateTime<Utc>,
    subpath: &str,
    reply: &Responder,
) -> Result<(), AppError> {
    let backup = find_backup(state, id).await?;
    require_revision(state, &backup, &revision).await?;
    let Some(_lease) = state.runner.lease_or_report(&backup, reply.correlation()) else {
        return Ok(());
    };

    let out_dir = state.layout.restore_dir(&backup);
    let result = async {
        state
            .statuses
            .set_status(&backup, StatusPatch::status(RunState::Working), reply.correlation())
            .await?;
        tracing::info!(backup_id = %backup.id, out_dir = %out_dir.display(), "Restoring revision");
        state
            .tool
            .restore(
                &state.layout.repo_dir(&backup),
                &backup.name,
                &revision,
                subpath,
                &out_dir,
            )
            .await
    }
    .await;

    settle(state, &backup, reply).await;
    match result {
        Ok(()) => Ok(()),
        Err(ToolError::NotEmpty(dir)) => Err(AppError::precondition(format!(
            "Failed to restore:\nDirectory {} is not empty!",
            dir.display()
        ))),
        Err(e) => Err(AppError::precondition(format!(
            "Failed to restore:\n{}",
            e.detail()
        ))),
    }
}
