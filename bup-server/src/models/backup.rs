use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Backup ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Assigned by the server when a client submits an empty id
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub cron_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

impl Backup {
    /// Checks the fields that do not depend on the rest of the config.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("Missing required info: name".into());
        }
        if name != self.name || name == "." || name == ".." || name.contains('/') {
            return Err(format!("Invalid backup name: {:?}", self.name));
        }
        if self.sources.iter().all(|s| s.trim().is_empty()) {
            return Err("Missing required info: sources".into());
        }
        crate::utils::cron::validate(&self.cron_line)
            .map_err(|e| format!("Invalid cron line: {e}"))?;
        Ok(())
    }
}

// ── Config ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub root_path: PathBuf,
    #[serde(default)]
    pub backups: Vec<Backup>,
}

impl Config {
    pub fn empty(root_path: PathBuf) -> Self {
        Self {
            root_path,
            backups: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Backup> {
        self.backups.iter().find(|b| b.id == id)
    }

    pub fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.backups
            .iter()
            .any(|b| b.name == name && Some(b.id.as_str()) != except_id)
    }

    /// Stable sort by name, the order every persisted config is kept in.
    pub fn sorted(mut self) -> Self {
        self.backups.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    pub fn with_backup(mut self, backup: Backup) -> Self {
        self.backups.retain(|b| b.id != backup.id);
        self.backups.push(backup);
        self
    }

    pub fn without_backup(mut self, id: &str) -> Self {
        self.backups.retain(|b| b.id != id);
        self
    }
}
