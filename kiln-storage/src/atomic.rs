//! Atomic whole-file writes for the persistent stores.

use crate::StorageResult;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Write data to a file atomically with fsync for durability.
///
/// Write–fsync–rename:
/// 1. Write data to a temporary file next to the destination
/// 2. fsync the temp file (flush to disk)
/// 3. Rename temp file to final destination (atomic operation)
/// 4. fsync the parent directory (ensure the directory entry is durable)
pub fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    file.write_all(data)?;

    // fsync the file data to disk before rename
    file.sync_all()?;
    drop(file);

    // POSIX guarantees rename atomicity
    fs::rename(&temp_path, path)?;

    // Best effort - some filesystems don't support directory fsync
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
