use std::path::Path;

/// True when `path` exists and is a directory. Never fails; errors are logged.
pub async fn is_accessible_dir(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_dir(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Directory is not accessible: {}", e);
            false
        }
    }
}

/// True when `path` is missing or an empty directory.
pub async fn is_missing_or_empty(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
