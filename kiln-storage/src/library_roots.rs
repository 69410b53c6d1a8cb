//! Library root store: external library file → last-known digest.
//!
//! Persisted as a columnar document with two parallel columns (relative path
//! strings and hex digests), rewritten wholesale on save and skipped
//! entirely when unchanged.

use crate::atomic::atomic_write;
use crate::digest::ContentHash;
use crate::relativizer::PathRelativizer;
use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Columns {
    paths: Vec<String>,
    digests: Vec<String>,
}

/// Result of diffing the current classpath against the stored roots.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LibraryDiff {
    /// Roots whose digest differs from the stored one, including roots never
    /// seen before.
    pub changed: Vec<PathBuf>,

    /// Stored roots that are no longer on the classpath.
    pub deleted: Vec<PathBuf>,
}

impl LibraryDiff {
    /// True when the classpath matches the stored state exactly.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Persistent library-root digest store.
#[derive(Debug)]
pub struct LibraryRootsStore {
    path: PathBuf,
    relativizer: Arc<PathRelativizer>,
    state: Mutex<RootsState>,
}

#[derive(Debug, Default)]
struct RootsState {
    roots: BTreeMap<String, ContentHash>,
    modified: bool,
}

impl LibraryRootsStore {
    /// Open the store, decoding the columnar file when it exists.
    pub fn open(path: PathBuf, relativizer: Arc<PathRelativizer>) -> StorageResult<Self> {
        let roots = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let columns: Columns = serde_json::from_str(&text)
                .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?;
            if columns.paths.len() != columns.digests.len() {
                return Err(StorageError::Corrupted(format!(
                    "{}: column length mismatch ({} paths, {} digests)",
                    path.display(),
                    columns.paths.len(),
                    columns.digests.len()
                )));
            }
            columns
                .paths
                .into_iter()
                .zip(columns.digests.into_iter().map(ContentHash::from_hex))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            relativizer,
            state: Mutex::new(RootsState {
                roots,
                modified: false,
            }),
        })
    }

    /// Diff the current classpath against the stored state.
    ///
    /// Each current root is digested on disk; an unreadable root counts as
    /// changed so it gets re-examined rather than silently skipped.
    pub fn diff(&self, classpath: &[PathBuf]) -> StorageResult<LibraryDiff> {
        let state = self.lock();
        let mut diff = LibraryDiff::default();
        let mut seen = std::collections::BTreeSet::new();

        for root in classpath {
            let key = self.relativizer.relativize(root);
            let _ = seen.insert(key.clone());
            match ContentHash::from_file(root) {
                Ok(actual) => {
                    if state.roots.get(&key) != Some(&actual) {
                        diff.changed.push(root.clone());
                    }
                }
                Err(e) => {
                    debug!("digesting library root {} failed: {e}", root.display());
                    diff.changed.push(root.clone());
                }
            }
        }

        for key in state.roots.keys() {
            if !seen.contains(key) {
                diff.deleted.push(self.relativizer.absolutize(key));
            }
        }

        if !diff.is_empty() {
            info!(
                "library roots: {} changed, {} deleted",
                diff.changed.len(),
                diff.deleted.len()
            );
        }
        Ok(diff)
    }

    /// The stored digest of a root, if any.
    pub fn get(&self, root: &Path) -> Option<ContentHash> {
        let key = self.relativizer.relativize(root);
        self.lock().roots.get(&key).cloned()
    }

    /// Record a root's digest.
    pub fn update(&self, root: &Path, digest: ContentHash) {
        let key = self.relativizer.relativize(root);
        let mut state = self.lock();
        let _ = state.roots.insert(key, digest);
        state.modified = true;
    }

    /// Drop a root that left the classpath.
    pub fn remove(&self, root: &Path) {
        let key = self.relativizer.relativize(root);
        let mut state = self.lock();
        if state.roots.remove(&key).is_some() {
            state.modified = true;
        }
    }

    /// Rewrite the columnar file wholesale; skipped when unchanged.
    pub fn save(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if !state.modified {
            return Ok(());
        }
        let columns = Columns {
            paths: state.roots.keys().cloned().collect(),
            digests: state.roots.values().map(|d| d.as_str().to_owned()).collect(),
        };
        let json = serde_json::to_string(&columns)?;
        atomic_write(&self.path, json.as_bytes())?;
        state.modified = false;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RootsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> LibraryRootsStore {
        let relativizer = Arc::new(PathRelativizer::new(temp.path()));
        LibraryRootsStore::open(temp.path().join("libraries.json"), relativizer).unwrap()
    }

    #[test]
    fn new_root_reports_changed() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("lib.jar");
        std::fs::write(&jar, b"v1").unwrap();

        let diff = store(&temp).diff(&[jar.clone()]).unwrap();
        assert_eq!(diff.changed, vec![jar]);
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn unchanged_root_is_quiet_after_update() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("lib.jar");
        std::fs::write(&jar, b"v1").unwrap();

        let store = store(&temp);
        store.update(&jar, ContentHash::from_file(&jar).unwrap());
        assert!(store.diff(std::slice::from_ref(&jar)).unwrap().is_empty());

        std::fs::write(&jar, b"v2").unwrap();
        let diff = store.diff(std::slice::from_ref(&jar)).unwrap();
        assert_eq!(diff.changed, vec![jar]);
    }

    #[test]
    fn missing_root_reports_deleted() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("lib.jar");
        std::fs::write(&jar, b"v1").unwrap();

        let store = store(&temp);
        store.update(&jar, ContentHash::from_file(&jar).unwrap());
        let diff = store.diff(&[]).unwrap();
        assert_eq!(diff.deleted, vec![jar]);
    }

    #[test]
    fn columnar_file_round_trips() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("lib.jar");
        std::fs::write(&jar, b"v1").unwrap();
        let digest = ContentHash::from_file(&jar).unwrap();
        {
            let store = store(&temp);
            store.update(&jar, digest.clone());
            store.save().unwrap();
        }
        let reopened = store(&temp);
        assert_eq!(reopened.get(&jar), Some(digest));
    }

    #[test]
    fn mismatched_columns_report_corruption() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("libraries.json"),
            r#"{"paths":["a.jar"],"digests":[]}"#,
        )
        .unwrap();
        let relativizer = Arc::new(PathRelativizer::new(temp.path()));
        let result = LibraryRootsStore::open(temp.path().join("libraries.json"), relativizer);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }
}
