//! Whole-document persistence of the fleet model
//!
//! The state file is loaded once at the start of a run and rewritten wholesale
//! at every checkpoint. Saves go through a sibling temp file and a rename so an
//! interrupted write never leaves a truncated state file behind.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::model::Cluster;
use crate::{Error, Result};

/// Loader/saver of the persisted fleet model
pub trait ClusterStore: Send + Sync {
    /// Load every cluster record from `path`
    fn load(&self, path: &Path) -> Result<Vec<Cluster>>;

    /// Replace the document at `path` with `clusters`
    fn save(&self, path: &Path, clusters: &[Cluster]) -> Result<()>;
}

/// JSON file implementation of [`ClusterStore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileStore;

impl ClusterStore for JsonFileStore {
    fn load(&self, path: &Path) -> Result<Vec<Cluster>> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::persistence(path, format!("failed to read: {}", e)))?;
        let clusters: Vec<Cluster> = serde_json::from_str(&data)
            .map_err(|e| Error::persistence(path, format!("failed to decode: {}", e)))?;
        debug!(path = %path.display(), clusters = clusters.len(), "loaded fleet state");
        Ok(clusters)
    }

    fn save(&self, path: &Path, clusters: &[Cluster]) -> Result<()> {
        let data = serde_json::to_string_pretty(clusters)
            .map_err(|e| Error::persistence(path, format!("failed to encode: {}", e)))?;

        let tmp = temp_path(path);
        std::fs::write(&tmp, data)
            .map_err(|e| Error::persistence(path, format!("failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::persistence(path, format!("failed to replace state file: {}", e)))?;

        debug!(path = %path.display(), clusters = clusters.len(), "saved fleet state");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "clusters.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
