/// Snapshot persistence for the in-memory store.
///
/// The whole [`MemoryStore`] (source collections, cube collections with
/// their indexes, cube metadata, coordinator state and the change log) is
/// written as one JSON document. Writes go to a temporary file that is then
/// renamed over the target, so a crash mid-save leaves the previous
/// snapshot intact.
///
/// # Usage
///
/// ```ignore
/// persistence::save(&store, &path).await?;
/// let store = persistence::load(&path).await?;
/// ```
use crate::error::{OlapError, OlapResult};
use crate::storage::{MemoryStore, StoreSnapshot};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    /// Format version
    version: u32,
    #[serde(flatten)]
    store: StoreSnapshot,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Save the store to `path`, replacing any previous snapshot.
///
/// Parent directories are created as needed.
///
/// # Errors
///
/// Returns `OlapError::StorageError` if the directory, the temporary file
/// or the final rename cannot be written.
pub async fn save(store: &MemoryStore, path: &Path) -> OlapResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OlapError::StorageError(format!("Failed to create directory: {}", e)))?;
        }
    }

    let snapshot = SnapshotFile {
        version: SNAPSHOT_VERSION,
        store: store.snapshot().await,
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| OlapError::StorageError(format!("Failed to write snapshot: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| OlapError::StorageError(format!("Failed to rename snapshot: {}", e)))?;

    debug!(path = %path.display(), bytes = bytes.len(), "snapshot saved");
    Ok(())
}

/// Load a store from `path`.
///
/// # Errors
///
/// Returns `OlapError::StorageError` if the file cannot be read or was
/// written by an incompatible version, and `SerializationError` if it is
/// not a valid snapshot.
pub async fn load(path: &Path) -> OlapResult<MemoryStore> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| OlapError::StorageError(format!("Failed to read snapshot: {}", e)))?;

    let snapshot: SnapshotFile = serde_json::from_slice(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(OlapError::StorageError(format!(
            "Incompatible snapshot version: {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }

    debug!(
        path = %path.display(),
        collections = snapshot.store.collections.len(),
        events = snapshot.store.change_log.len(),
        "snapshot loaded"
    );
    Ok(MemoryStore::from_snapshot(snapshot.store))
}

/// Load `path` if it exists, otherwise start empty.
pub async fn load_or_default(path: &Path) -> OlapResult<MemoryStore> {
    if exists(path).await {
        load(path).await
    } else {
        Ok(MemoryStore::new())
    }
}

/// Check if a snapshot exists at `path`.
pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}
