//! Content stamp store: source file → digest at last successful compilation.

use crate::atomic::atomic_write;
use crate::digest::ContentHash;
use crate::relativizer::PathRelativizer;
use crate::{StorageError, StorageResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-target stamp store.
///
/// A stamp, once present, always reflects the content at the last successful
/// compilation of that file; callers must only commit stamps after an
/// error-free round. A missing stamp means "unknown" and the file is treated
/// as dirty.
#[derive(Debug)]
pub struct FileStampStore {
    path: PathBuf,
    relativizer: Arc<PathRelativizer>,
    state: Mutex<StampState>,
}

#[derive(Debug, Default)]
struct StampState {
    stamps: BTreeMap<String, ContentHash>,
    modified: bool,
}

impl FileStampStore {
    /// Open a stamp store, loading the backing file when it exists.
    pub fn open(path: PathBuf, relativizer: Arc<PathRelativizer>) -> StorageResult<Self> {
        let stamps = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Vec<(String, ContentHash)>>(&text)
                .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?
                .into_iter()
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            relativizer,
            state: Mutex::new(StampState {
                stamps,
                modified: false,
            }),
        })
    }

    /// Record a file's digest.
    pub fn stamp(&self, file: &Path, digest: ContentHash) {
        let key = self.relativizer.relativize(file);
        let mut state = self.lock();
        let _ = state.stamps.insert(key, digest);
        state.modified = true;
    }

    /// Forget a file's digest but keep the descriptor alive elsewhere.
    ///
    /// Used when an output entry is invalidated: the next `is_dirty` check
    /// reports the file dirty.
    pub fn invalidate(&self, file: &Path) {
        let key = self.relativizer.relativize(file);
        let mut state = self.lock();
        if state.stamps.remove(&key).is_some() {
            state.modified = true;
        }
    }

    /// Drop a file's record entirely (source confirmed deleted and processed).
    pub fn remove(&self, file: &Path) {
        self.invalidate(file);
    }

    /// The recorded digest, if any.
    pub fn get(&self, file: &Path) -> Option<ContentHash> {
        let key = self.relativizer.relativize(file);
        self.lock().stamps.get(&key).cloned()
    }

    /// Compare the recorded digest against the file's current contents.
    ///
    /// Missing stamp or unreadable file both report dirty, conservatively.
    pub fn is_dirty(&self, file: &Path) -> bool {
        let Some(stored) = self.get(file) else {
            return true;
        };
        match ContentHash::from_file(file) {
            Ok(actual) => actual != stored,
            Err(e) => {
                debug!("stamp check failed for {}: {e}", file.display());
                true
            }
        }
    }

    /// All files this store has a stamp for, as absolute paths.
    ///
    /// Used to detect deletions: a stamped file that no longer exists on
    /// disk was removed since the last build.
    pub fn stamped_files(&self) -> Vec<PathBuf> {
        self.lock()
            .stamps
            .keys()
            .map(|key| self.relativizer.absolutize(key))
            .collect()
    }

    /// Persist the store, skipping the write when nothing changed.
    pub fn save(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if !state.modified {
            return Ok(());
        }
        let entries: Vec<(&String, &ContentHash)> = state.stamps.iter().collect();
        let json = serde_json::to_string_pretty(&entries)?;
        atomic_write(&self.path, json.as_bytes())?;
        state.modified = false;
        debug!("saved {} stamps to {}", state.stamps.len(), self.path.display());
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StampState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
