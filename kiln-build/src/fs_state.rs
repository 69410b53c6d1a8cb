//! Dirty/removed file tracking across the rounds of one build invocation.

use crate::error::BuildResult;
use crate::target::{BuildTarget, RootId, TargetChunk, TargetId};
use kiln_storage::{ContentHash, FileStampStore};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Which round a mid-build dirty mark lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationRound {
    /// Visible to the remaining passes of the running round.
    Current,

    /// Deferred until the next round starts, so graph-driven marks cannot
    /// loop the round that produced them.
    Next,
}

/// Per-target dirty and removed files for one round.
#[derive(Debug, Default, Clone)]
pub struct FilesDelta {
    dirty: BTreeMap<RootId, BTreeSet<PathBuf>>,
    removed: BTreeSet<PathBuf>,
}

impl FilesDelta {
    fn mark_dirty(&mut self, root: RootId, file: PathBuf) -> bool {
        self.dirty.entry(root).or_default().insert(file)
    }

    fn merge(&mut self, other: FilesDelta) {
        for (root, files) in other.dirty {
            self.dirty.entry(root).or_default().extend(files);
        }
        self.removed.extend(other.removed);
    }

    /// Dirty files grouped by source root.
    pub fn dirty(&self) -> &BTreeMap<RootId, BTreeSet<PathBuf>> {
        &self.dirty
    }

    /// Files known-deleted this build.
    pub fn removed(&self) -> &BTreeSet<PathBuf> {
        &self.removed
    }

    /// True when no file needs attention.
    pub fn is_empty(&self) -> bool {
        self.dirty.values().all(BTreeSet::is_empty) && self.removed.is_empty()
    }

    fn dirty_count(&self) -> usize {
        self.dirty.values().map(BTreeSet::len).sum()
    }
}

#[derive(Debug, Default)]
struct TargetState {
    current: FilesDelta,
    next: FilesDelta,
    initialized: bool,
}

/// Snapshot of a chunk's dirty state handed to builder passes for one round.
#[derive(Debug, Default, Clone)]
pub struct DirtyFilesView {
    per_target: BTreeMap<TargetId, FilesDelta>,
}

impl DirtyFilesView {
    /// Dirty files of one target, flattened across roots.
    pub fn dirty_for(&self, target: TargetId) -> Vec<PathBuf> {
        self.per_target
            .get(&target)
            .map(|delta| delta.dirty().values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Every (target, file) pair in the view.
    pub fn all_dirty(&self) -> Vec<(TargetId, PathBuf)> {
        self.per_target
            .iter()
            .flat_map(|(target, delta)| {
                delta
                    .dirty()
                    .values()
                    .flatten()
                    .map(|file| (*target, file.clone()))
            })
            .collect()
    }

    /// Files of a target known-deleted this build.
    pub fn removed_for(&self, target: TargetId) -> Vec<PathBuf> {
        self.per_target
            .get(&target)
            .map(|delta| delta.removed().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when no target has work.
    pub fn is_empty(&self) -> bool {
        self.per_target.values().all(FilesDelta::is_empty)
    }

    /// Number of dirty files across the chunk.
    pub fn file_count(&self) -> usize {
        self.per_target.values().map(FilesDelta::dirty_count).sum()
    }
}

/// The per-build dirty/removed state tracker.
///
/// One mutex guards the whole map; bulk operations hold it for the duration
/// of their scan so concurrent mark operations from other chunks' passes
/// cannot interleave with it.
#[derive(Debug, Default)]
pub struct FsState {
    targets: Mutex<HashMap<TargetId, TargetState>>,
}

impl FsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a target's dirty state once per build.
    ///
    /// Forced (clean) mode marks every source file dirty. Incremental mode
    /// marks files whose persisted stamp differs from the on-disk digest,
    /// plus records stamped files that disappeared as removed. Marks
    /// injected by other components before initialization are kept.
    pub fn initialize(
        &self,
        target: &BuildTarget,
        stamps: &FileStampStore,
        forced: bool,
    ) -> BuildResult<()> {
        let mut targets = self.lock();
        let state = targets.entry(target.id()).or_default();
        if state.initialized {
            return Ok(());
        }

        let mut on_disk = BTreeSet::new();
        for root in target.source_roots() {
            if !root.path.exists() {
                continue;
            }
            for entry in WalkDir::new(&root.path).follow_links(true) {
                let entry = entry.map_err(|e| {
                    std::io::Error::other(format!("scanning {}: {e}", root.path.display()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let file = entry.path().to_path_buf();
                if forced || stamps.is_dirty(&file) {
                    let _ = state.current.mark_dirty(root.id, file.clone());
                }
                let _ = on_disk.insert(file);
            }
        }

        for stamped in stamps.stamped_files() {
            if !on_disk.contains(&stamped) && target.find_root(&stamped).is_some() {
                let _ = state.current.removed.insert(stamped);
            }
        }

        state.initialized = true;
        debug!(
            "initialized {}: {} dirty, {} removed (forced: {forced})",
            target.name(),
            state.current.dirty_count(),
            state.current.removed.len()
        );
        Ok(())
    }

    /// Inject one more dirty file, for the current or the next round.
    ///
    /// Other components (graph differentiation, library tracking, chained
    /// targets) call this mid-build; the target may not be initialized yet.
    pub fn mark_dirty(
        &self,
        target: TargetId,
        root: RootId,
        file: PathBuf,
        round: CompilationRound,
    ) {
        let mut targets = self.lock();
        let state = targets.entry(target).or_default();
        let delta = match round {
            CompilationRound::Current => &mut state.current,
            CompilationRound::Next => &mut state.next,
        };
        if delta.mark_dirty(root, file.clone()) {
            debug!("marked dirty ({round:?}): {}", file.display());
        }
    }

    /// Mark every source file of a chunk dirty (chunk-rebuild escalation).
    pub fn mark_chunk_dirty(
        &self,
        chunk: &TargetChunk,
        project_targets: &[&BuildTarget],
        round: CompilationRound,
    ) -> BuildResult<()> {
        for target in project_targets {
            if !chunk.contains(target.id()) {
                continue;
            }
            for root in target.source_roots() {
                if !root.path.exists() {
                    continue;
                }
                for entry in WalkDir::new(&root.path).follow_links(true) {
                    let entry = entry.map_err(|e| {
                        std::io::Error::other(format!("scanning {}: {e}", root.path.display()))
                    })?;
                    if entry.file_type().is_file() {
                        self.mark_dirty(
                            target.id(),
                            root.id,
                            entry.path().to_path_buf(),
                            round,
                        );
                    }
                }
            }
        }
        info!("marked whole chunk dirty for {round:?} round");
        Ok(())
    }

    /// Promote next-round marks into the current round. Called at every
    /// round start.
    pub fn before_round(&self, chunk: &TargetChunk) {
        let mut targets = self.lock();
        for id in &chunk.targets {
            let state = targets.entry(*id).or_default();
            let next = std::mem::take(&mut state.next);
            state.current.merge(next);
        }
    }

    /// Snapshot the chunk's current-round state for builder passes.
    pub fn dirty_view(&self, chunk: &TargetChunk) -> DirtyFilesView {
        let targets = self.lock();
        DirtyFilesView {
            per_target: chunk
                .targets
                .iter()
                .filter_map(|id| targets.get(id).map(|s| (*id, s.current.clone())))
                .collect(),
        }
    }

    /// Files of a target known-deleted this build.
    pub fn removed(&self, target: TargetId) -> Vec<PathBuf> {
        self.lock()
            .get(&target)
            .map(|s| s.current.removed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Claim a target's removed files for processing, clearing them.
    pub fn take_removed(&self, target: TargetId) -> Vec<PathBuf> {
        let mut targets = self.lock();
        targets
            .get_mut(&target)
            .map(|s| std::mem::take(&mut s.current.removed).into_iter().collect())
            .unwrap_or_default()
    }

    /// Restore removed paths that a failed chunk never finished processing,
    /// so the next invocation sees them again.
    pub fn re_register_removed(&self, target: TargetId, files: Vec<PathBuf>) {
        let mut targets = self.lock();
        let state = targets.entry(target).or_default();
        state.current.removed.extend(files);
    }

    /// Drop the given files from the current dirty set after they compiled.
    pub fn clear_compiled(&self, target: TargetId, files: &[PathBuf]) {
        let mut targets = self.lock();
        if let Some(state) = targets.get_mut(&target) {
            for set in state.current.dirty.values_mut() {
                for file in files {
                    let _ = set.remove(file);
                }
            }
        }
    }

    /// Forget a chunk's dirty round data after its build finished. Removed
    /// files stay recorded until a successful build processes them.
    pub fn clear_round_data(&self, chunk: &TargetChunk) {
        let mut targets = self.lock();
        for id in &chunk.targets {
            if let Some(state) = targets.get_mut(id) {
                let removed = std::mem::take(&mut state.current.removed);
                state.current = FilesDelta::default();
                state.current.removed = removed;
                state.next = FilesDelta::default();
            }
        }
    }

    /// True when some target still has unprocessed dirty or removed files.
    pub fn has_unprocessed_changes(&self, target: TargetId) -> bool {
        self.lock()
            .get(&target)
            .map(|s| !s.current.is_empty() || !s.next.is_empty())
            .unwrap_or(false)
    }

    /// Run a closure over a target's current delta while holding the data
    /// lock, so the scan cannot interleave with concurrent marks.
    pub fn with_delta<R>(&self, target: TargetId, f: impl FnOnce(&FilesDelta) -> R) -> Option<R> {
        let targets = self.lock();
        targets.get(&target).map(|s| f(&s.current))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TargetId, TargetState>> {
        match self.targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Digest a file and stamp it; used when committing compiled files.
pub fn stamp_current_content(stamps: &FileStampStore, file: &Path) -> BuildResult<()> {
    match ContentHash::from_file(file) {
        Ok(digest) => {
            stamps.stamp(file, digest);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // vanished between compile and commit; leave unstamped so the
            // next build re-examines it
            stamps.invalidate(file);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SourceRoot;
    use kiln_storage::PathRelativizer;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn fixture(temp: &TempDir) -> (BuildTarget, FileStampStore) {
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("A.kt"), "class A").unwrap();
        std::fs::write(src.join("B.kt"), "class B").unwrap();

        let target = BuildTarget::new(
            TargetId(1),
            "app",
            vec![SourceRoot {
                id: RootId(0),
                path: src,
                generated: false,
            }],
            temp.path().join("out"),
            false,
            vec![],
        );
        let stamps = FileStampStore::open(
            temp.path().join("stamps.json"),
            Arc::new(PathRelativizer::new(temp.path())),
        )
        .unwrap();
        (target, stamps)
    }

    fn chunk() -> TargetChunk {
        TargetChunk {
            targets: vec![TargetId(1)],
        }
    }

    #[traced_test]
    #[test]
    fn forced_initialization_marks_everything() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);

        let fs = FsState::new();
        fs.initialize(&target, &stamps, true).unwrap();
        assert_eq!(fs.dirty_view(&chunk()).file_count(), 2);
    }

    #[test]
    fn stamped_files_stay_clean_incrementally() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);
        let a = temp.path().join("src/A.kt");
        stamp_current_content(&stamps, &a).unwrap();

        let fs = FsState::new();
        fs.initialize(&target, &stamps, false).unwrap();
        let view = fs.dirty_view(&chunk());
        assert_eq!(view.dirty_for(TargetId(1)), vec![temp.path().join("src/B.kt")]);
    }

    #[test]
    fn vanished_stamped_file_is_reported_removed() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);
        let a = temp.path().join("src/A.kt");
        stamp_current_content(&stamps, &a).unwrap();
        std::fs::remove_file(&a).unwrap();

        let fs = FsState::new();
        fs.initialize(&target, &stamps, false).unwrap();
        assert_eq!(fs.take_removed(TargetId(1)), vec![a]);
        // claimed: second take is empty
        assert!(fs.take_removed(TargetId(1)).is_empty());
    }

    #[test]
    fn next_round_marks_surface_after_promotion() {
        let temp = TempDir::new().unwrap();
        let (_target, _stamps) = fixture(&temp);
        let file = temp.path().join("src/A.kt");

        let fs = FsState::new();
        fs.mark_dirty(TargetId(1), RootId(0), file.clone(), CompilationRound::Next);
        assert!(fs.dirty_view(&chunk()).is_empty() || fs.dirty_view(&chunk()).file_count() == 0);

        fs.before_round(&chunk());
        assert_eq!(fs.dirty_view(&chunk()).dirty_for(TargetId(1)), vec![file]);
    }

    #[test]
    fn marks_before_initialization_survive_it() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);
        let a = temp.path().join("src/A.kt");
        let b = temp.path().join("src/B.kt");
        stamp_current_content(&stamps, &a).unwrap();
        stamp_current_content(&stamps, &b).unwrap();

        let fs = FsState::new();
        // graph differentiation injected A before the target initialized
        fs.mark_dirty(TargetId(1), RootId(0), a.clone(), CompilationRound::Current);
        fs.initialize(&target, &stamps, false).unwrap();

        assert_eq!(fs.dirty_view(&chunk()).dirty_for(TargetId(1)), vec![a]);
    }

    #[test]
    fn bulk_iteration_sees_a_consistent_delta() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);

        let fs = FsState::new();
        fs.initialize(&target, &stamps, true).unwrap();
        let counts = fs.with_delta(TargetId(1), |delta| {
            (delta.dirty().values().flatten().count(), delta.removed().len())
        });
        assert_eq!(counts, Some((2, 0)));
        assert!(fs.with_delta(TargetId(9), |_| ()).is_none());
    }

    #[test]
    fn clear_compiled_drops_only_named_files() {
        let temp = TempDir::new().unwrap();
        let (target, stamps) = fixture(&temp);

        let fs = FsState::new();
        fs.initialize(&target, &stamps, true).unwrap();
        fs.clear_compiled(TargetId(1), &[temp.path().join("src/A.kt")]);
        assert_eq!(
            fs.dirty_view(&chunk()).dirty_for(TargetId(1)),
            vec![temp.path().join("src/B.kt")]
        );
    }
}
