use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub config_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub log_level: String,
    pub bup_bin: String,
    pub git_bin: String,
    pub du_bin: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1234),
            config_dir: PathBuf::from(
                std::env::var("CONFIG_DIR").unwrap_or_else(|_| "/config".into()),
            ),
            backups_dir: PathBuf::from(
                std::env::var("BACKUPS_DIR").unwrap_or_else(|_| "/backups".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            bup_bin: std::env::var("BUP_BIN").unwrap_or_else(|_| "bup".into()),
            git_bin: std::env::var("GIT_BIN").unwrap_or_else(|_| "git".into()),
            du_bin: std::env::var("DU_BIN").unwrap_or_else(|_| "du".into()),
        }
    }

    /// Config rooted at the given directories, everything else default.
    pub fn with_dirs(config_dir: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 0,
            config_dir: config_dir.into(),
            backups_dir: backups_dir.into(),
            log_level: "info".into(),
            bup_bin: "bup".into(),
            git_bin: "git".into(),
            du_bin: "du".into(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Fails startup when either directory cannot be reached.
    pub fn check_paths(&self) -> anyhow::Result<()> {
        check_path("CONFIG_DIR", &self.config_dir)?;
        check_path("BACKUPS_DIR", &self.backups_dir)?;
        Ok(())
    }
}

fn check_path(variable: &str, path: &Path) -> anyhow::Result<()> {
    match std::fs::metadata(path) {
        Ok(_) => {
            tracing::info!("Found {} {}", variable, path.display());
            Ok(())
        }
        Err(e) => anyhow::bail!(
            "Could not access {}. To override, set {}\n{}",
            path.display(),
            variable,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_paths() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let ok = AppConfig::with_dirs(temp_dir.path(), temp_dir.path());
        ok.check_paths()?;

        let missing = AppConfig::with_dirs(temp_dir.path(), temp_dir.path().join("nope"));
        let err = missing.check_paths().unwrap_err().to_string();
        assert!(err.contains("To override, set BACKUPS_DIR"));
        Ok(())
    }

    #[test]
    fn test_config_file_location() {
        let config = AppConfig::with_dirs("/config", "/backups");
        assert_eq!(config.config_file(), PathBuf::from("/config/config.json"));
    }
}
