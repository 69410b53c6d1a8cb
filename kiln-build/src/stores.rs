//! The per-build bundle of persistent stores.

use crate::target::TargetId;
use kiln_storage::{
    FileStampStore, LibraryRootsStore, PathRelativizer, SourceOutputMap, StorageResult,
    TargetsStateStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// All persistent stores of one build data directory, opened once per build
/// and flushed together at the end.
///
/// Per-target stores (stamps, source→output maps) open lazily on first use.
pub struct BuildStores {
    data_dir: PathBuf,
    relativizer: Arc<PathRelativizer>,
    stamps: Mutex<HashMap<TargetId, Arc<FileStampStore>>>,
    source_maps: Mutex<HashMap<TargetId, Arc<SourceOutputMap>>>,
    library_roots: LibraryRootsStore,
    targets_state: TargetsStateStore,
}

impl BuildStores {
    /// Open the store bundle under a data directory, relativizing against
    /// the project root.
    pub fn open(data_dir: &Path, project_root: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let relativizer = Arc::new(PathRelativizer::new(project_root));
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            library_roots: LibraryRootsStore::open(
                data_dir.join("libraries.json"),
                Arc::clone(&relativizer),
            )?,
            targets_state: TargetsStateStore::open(data_dir.join("targets_state.json"))?,
            relativizer,
            stamps: Mutex::new(HashMap::new()),
            source_maps: Mutex::new(HashMap::new()),
        })
    }

    /// The project-root relativizer shared by all stores.
    pub fn relativizer(&self) -> &Arc<PathRelativizer> {
        &self.relativizer
    }

    /// Where the dependency-graph stores live.
    pub fn graph_dir(&self) -> PathBuf {
        self.data_dir.join("graph")
    }

    /// The stamp store of a target, opened on first use.
    pub fn stamps_for(&self, target: TargetId) -> StorageResult<Arc<FileStampStore>> {
        let mut stamps = lock(&self.stamps);
        if let Some(store) = stamps.get(&target) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(FileStampStore::open(
            self.target_dir(target).join("stamps.json"),
            Arc::clone(&self.relativizer),
        )?);
        let _ = stamps.insert(target, Arc::clone(&store));
        Ok(store)
    }

    /// The source→output map of a target, opened on first use.
    pub fn source_map_for(&self, target: TargetId) -> StorageResult<Arc<SourceOutputMap>> {
        let mut maps = lock(&self.source_maps);
        if let Some(store) = maps.get(&target) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SourceOutputMap::open(
            self.target_dir(target).join("srcmap.json"),
            Arc::clone(&self.relativizer),
        )?);
        let _ = maps.insert(target, Arc::clone(&store));
        Ok(store)
    }

    /// The library-roots digest store.
    pub fn library_roots(&self) -> &LibraryRootsStore {
        &self.library_roots
    }

    /// The build-time statistics store.
    pub fn targets_state(&self) -> &TargetsStateStore {
        &self.targets_state
    }

    /// Flush every opened store; writes are skipped for unmodified stores.
    pub fn save_all(&self) -> StorageResult<()> {
        for store in lock(&self.stamps).values() {
            store.save()?;
        }
        for store in lock(&self.source_maps).values() {
            store.save()?;
        }
        self.library_roots.save()?;
        self.targets_state.save()?;
        debug!("flushed build stores under {}", self.data_dir.display());
        Ok(())
    }

    fn target_dir(&self, target: TargetId) -> PathBuf {
        self.data_dir.join("targets").join(target.0.to_string())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
