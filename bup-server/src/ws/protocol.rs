//! JSON frames exchanged over `/ws`. Every frame has a `type` and may carry a
//! `correlation` token.

use crate::models::{Backup, BackupStatus, Config, Correlation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    GetConfig,
    AddBackup {
        backup: Backup,
    },
    RemoveBackup {
        id: String,
    },
    EditBackup {
        backup: Backup,
    },
    RunNow {
        id: String,
    },
    GetBackupStatus {
        id: String,
    },
    GetRevisions {
        id: String,
    },
    RemoveRevision {
        id: String,
        revision: DateTime<Utc>,
    },
    Gc {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        all: bool,
    },
    Prune {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        all: bool,
    },
    Restore {
        id: String,
        revision: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subpath: Option<String>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::GetConfig => "get-config",
            ClientCommand::AddBackup { .. } => "add-backup",
            ClientCommand::RemoveBackup { .. } => "remove-backup",
            ClientCommand::EditBackup { .. } => "edit-backup",
            ClientCommand::RunNow { .. } => "run-now",
            ClientCommand::GetBackupStatus { .. } => "get-backup-status",
            ClientCommand::GetRevisions { .. } => "get-revisions",
            ClientCommand::RemoveRevision { .. } => "remove-revision",
            ClientCommand::Gc { .. } => "gc",
            ClientCommand::Prune { .. } => "prune",
            ClientCommand::Restore { .. } => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incoming {
    #[serde(default, skip_serializing_if = "Correlation::is_none")]
    pub correlation: Correlation,
    #[serde(flatten)]
    pub command: ClientCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Config {
        config: Config,
    },
    BackupStatus {
        id: String,
        status: BackupStatus,
    },
    BackupRevisions {
        id: String,
        revisions: Vec<DateTime<Utc>>,
    },
    ClientError {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Config,
    BackupStatus,
    BackupRevisions,
    ClientError,
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Config { .. } => MessageKind::Config,
            ServerMessage::BackupStatus { .. } => MessageKind::BackupStatus,
            ServerMessage::BackupRevisions { .. } => MessageKind::BackupRevisions,
            ServerMessage::ClientError { .. } => MessageKind::ClientError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    #[serde(default, skip_serializing_if = "Correlation::is_none")]
    pub correlation: Correlation,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Outgoing {
    pub fn new(message: ServerMessage, correlation: &Correlation) -> Self {
        Self {
            correlation: correlation.clone(),
            message,
        }
    }
}
