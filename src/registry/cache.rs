//! Atomic on-disk persistence of the tool catalog (`xiaozhi.cache.json`).

use crate::types::CachedToolCatalog;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to parse cache file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to write cache file: {0}")]
    Write(#[source] std::io::Error),
}

/// Load the catalog from disk. A missing or unparsable file is treated as
/// an empty cache rather than a hard error, matching the resilience the
/// registry needs on first-ever startup or after a corrupted write.
pub async fn load_cache(path: &Path) -> Result<CachedToolCatalog, CacheError> {
    if !path.exists() {
        return Ok(CachedToolCatalog::empty());
    }

    let content = tokio::fs::read_to_string(path).await.map_err(CacheError::Read)?;
    match serde_json::from_str(&content) {
        Ok(catalog) => Ok(catalog),
        Err(err) => {
            tracing::warn!(error = %err, "tool cache file is corrupt; treating as empty");
            Ok(CachedToolCatalog::empty())
        }
    }
}

/// Persist the catalog via temp-file + atomic rename so a reader never
/// observes a half-written file.
pub async fn save_cache(path: &Path, catalog: &CachedToolCatalog) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(CacheError::Write)?;
    }

    let tmp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(catalog)?;
    tokio::fs::write(&tmp_path, content).await.map_err(CacheError::Write)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(CacheError::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xiaozhi.cache.json");
        let catalog = load_cache(&path).await.unwrap();
        assert!(catalog.services.is_empty());
    }

    #[tokio::test]
    async fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xiaozhi.cache.json");
        let catalog = CachedToolCatalog::empty();

        save_cache(&path, &catalog).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let loaded = load_cache(&path).await.unwrap();
        assert_eq!(loaded.version, catalog.version);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty_rather_than_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xiaozhi.cache.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let catalog = load_cache(&path).await.unwrap();
        assert!(catalog.services.is_empty());
    }
}
