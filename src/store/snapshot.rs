// Repository snapshot files
//
// A MemoryStore is persisted as one bincode file. Writes go to a temp file
// in the same directory and are renamed over the target, so a crash leaves
// either the old or the new snapshot, never a torn one.

use crate::error::{Result, SyncError};
use crate::store::memory::{MemoryStore, StoreState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Snapshot format version
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    state: StoreState,
}

/// Load a repository snapshot.
pub fn load(path: &Path) -> Result<MemoryStore> {
    let file = fs::File::open(path)?;
    let snapshot: SnapshotFile = bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| SyncError::Store(format!("corrupt snapshot {}: {}", path.display(), e)))?;

    if snapshot.version != FORMAT_VERSION {
        return Err(SyncError::Store(format!(
            "unsupported snapshot version {} in {}",
            snapshot.version,
            path.display()
        )));
    }
    Ok(MemoryStore::from_state(snapshot.state))
}

/// Save a repository snapshot (atomic write).
pub fn save(store: &MemoryStore, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        bincode::serialize_into(
            &mut writer,
            &SnapshotFile {
                version: FORMAT_VERSION,
                state: store.state().clone(),
            },
        )
        .map_err(|e| SyncError::Store(format!("failed to encode snapshot: {}", e)))?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    // Atomic rename
    temp.persist(path).map_err(|e| SyncError::Io(e.error))?;
    tracing::debug!("Saved repository snapshot to {}", path.display());
    Ok(())
}
