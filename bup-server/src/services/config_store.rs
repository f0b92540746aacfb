use crate::models::Config;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Canonical backup list, cached in memory and mirrored to one JSON file.
pub struct ConfigStore {
    path: PathBuf,
    root_path: PathBuf,
    cached: RwLock<Option<Config>>,
    writing: AtomicBool,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root_path: root_path.into(),
            cached: RwLock::new(None),
            writing: AtomicBool::new(false),
        }
    }

    /// The cached config, loading it from disk on first use.
    pub async fn get(&self) -> Config {
        if let Some(config) = self.cached.read().await.as_ref() {
            return config.clone();
        }

        let mut cached = self.cached.write().await;
        if let Some(config) = cached.as_ref() {
            return config.clone();
        }

        let mut config = self.load().await;
        config.root_path = self.root_path.clone();
        let config = config.sorted();
        *cached = Some(config.clone());
        drop(cached);

        if let Err(e) = self.persist(&config).await {
            tracing::warn!("Failed to write config: {:#}", e);
        }
        config
    }

    pub async fn set(&self, config: Config) -> anyhow::Result<Config> {
        let config = config.sorted();
        *self.cached.write().await = Some(config.clone());
        self.persist(&config).await?;
        Ok(config)
    }

    /// Writes the in-memory config, if one was ever loaded.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let config = self.cached.read().await.clone();
        match config {
            Some(config) => self.persist(&config).await,
            None => Ok(()),
        }
    }

    async fn load(&self) -> Config {
        let loaded = async {
            let raw = tokio::fs::read_to_string(&self.path).await?;
            let config: Config = serde_json::from_str(&raw)?;
            anyhow::Ok(config)
        }
        .await;

        match loaded {
            Ok(config) => {
                tracing::info!(
                    path = %self.path.display(),
                    backups = config.backups.len(),
                    "Loaded config"
                );
                config
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Using default config: {:#}", e);
                Config::empty(self.root_path.clone())
            }
        }
    }

    async fn persist(&self, config: &Config) -> anyhow::Result<()> {
        if self.writing.swap(true, Ordering::AcqRel) {
            tracing::warn!("Already writing config!");
            return Ok(());
        }

        let result = self.write_file(config).await;
        self.writing.store(false, Ordering::Release);
        result
    }

    async fn write_file(&self, config: &Config) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "Config written");
        Ok(())
    }
}
