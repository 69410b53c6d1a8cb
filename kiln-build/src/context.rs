//! The explicit build context passed down through every component.
//!
//! There is no ambient keyed user-data map: everything a pass or engine
//! needs travels in [`BuildContext`], and chunk-local state layers on top of
//! it through [`ChunkContext`] (local override first, shared parent second).

use crate::fs_state::FsState;
use crate::graph::DependencyGraph;
use crate::messages::{BuildMessage, CompilerMessage, MessageKind, MessageSink};
use crate::stores::BuildStores;
use crate::target::{Project, TargetChunk, TargetId};
use crate::{BuildError, BuildResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation token, checked at round boundaries and before
/// each builder-pass invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; running work stops at its next check point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out when canceled.
    pub fn check(&self) -> BuildResult<()> {
        if self.is_canceled() {
            Err(BuildError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Which targets a build request covers and which it forces clean.
#[derive(Debug, Clone, Default)]
pub struct CompileScope {
    force_all: bool,
    forced: Vec<TargetId>,
    unaffected: Vec<TargetId>,
}

impl CompileScope {
    /// Incremental build of every target.
    pub fn incremental() -> Self {
        Self::default()
    }

    /// Full, non-incremental rebuild of every target.
    pub fn rebuild_all() -> Self {
        Self {
            force_all: true,
            ..Self::default()
        }
    }

    /// Force clean rebuilds of the given targets.
    pub fn with_forced(mut self, targets: Vec<TargetId>) -> Self {
        self.forced = targets;
        self
    }

    /// Exclude targets from this build request; their chunks skip
    /// compilation but still unblock dependents.
    pub fn with_unaffected(mut self, targets: Vec<TargetId>) -> Self {
        self.unaffected = targets;
        self
    }

    /// Whether the target participates in this build.
    pub fn is_affected(&self, target: TargetId) -> bool {
        !self.unaffected.contains(&target)
    }

    /// Whether every target of the chunk is excluded.
    pub fn is_chunk_affected(&self, chunk: &TargetChunk) -> bool {
        chunk.targets.iter().any(|t| self.is_affected(*t))
    }

    /// Whether the target must recompile from scratch.
    pub fn is_build_forced(&self, target: TargetId) -> bool {
        self.force_all || self.forced.contains(&target)
    }

    /// Whether the chunk as a whole is forced clean. Build forcing is
    /// all-or-nothing per chunk.
    pub fn is_chunk_forced(&self, chunk: &TargetChunk) -> bool {
        chunk.targets.iter().all(|t| self.is_build_forced(*t))
    }

    /// A whole-project incremental request: nothing forced, nothing excluded.
    pub fn is_fully_incremental(&self) -> bool {
        !self.force_all && self.forced.is_empty() && self.unaffected.is_empty()
    }

    /// A whole-project forced rebuild.
    pub fn is_full_rebuild(&self) -> bool {
        self.force_all && self.unaffected.is_empty()
    }
}

/// Per-pass accumulated timing, reported at the end of the build.
#[derive(Debug, Default)]
pub struct PassStatistics {
    by_pass: Mutex<HashMap<String, (u64, usize)>>,
}

impl PassStatistics {
    /// Accumulate one invocation of a pass.
    pub fn record(&self, pass: &str, elapsed_nanos: u64, processed_sources: usize) {
        let mut by_pass = match self.by_pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = by_pass.entry(pass.to_owned()).or_default();
        entry.0 += elapsed_nanos;
        entry.1 += processed_sources;
    }

    /// Emit one statistics message per pass, sorted by pass name.
    pub fn report(&self, sink: &dyn MessageSink) {
        let by_pass = match self.by_pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries: Vec<_> = by_pass.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (pass, (nanos, sources)) in entries {
            sink.process(BuildMessage::BuilderStatistics {
                builder: pass.clone(),
                processed_sources: *sources,
                elapsed_ms: nanos / 1_000_000,
            });
        }
    }
}

/// Everything shared across the whole build.
pub struct BuildContext {
    pub project: Arc<Project>,
    pub scope: CompileScope,
    pub stores: Arc<BuildStores>,
    pub fs_state: Arc<FsState>,
    pub graph: Arc<DependencyGraph>,
    pub cancel: CancelToken,
    pub stats: Arc<PassStatistics>,
    sink: Arc<dyn MessageSink>,
    errors: Arc<AtomicBool>,
}

impl BuildContext {
    pub fn new(
        project: Arc<Project>,
        scope: CompileScope,
        stores: Arc<BuildStores>,
        fs_state: Arc<FsState>,
        graph: Arc<DependencyGraph>,
        sink: Arc<dyn MessageSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            project,
            scope,
            stores,
            fs_state,
            graph,
            cancel,
            stats: Arc::new(PassStatistics::default()),
            sink,
            errors: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver a message, recording whether it was a compile error.
    pub fn message(&self, message: BuildMessage) {
        if let BuildMessage::Compiler(ref compiler) = message
            && compiler.kind == MessageKind::Error
        {
            self.errors.store(true, Ordering::SeqCst);
        }
        self.sink.process(message);
    }

    /// Shorthand for progress text.
    pub fn progress(&self, text: impl Into<String>) {
        self.sink.process(BuildMessage::Progress(text.into()));
    }

    /// Whether any compile error was reported during this build.
    pub fn errors_detected(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }

    /// Build-wide error flag, shared with components that report errors
    /// without going through `message` (the output sink's collision check).
    pub fn errors_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.errors)
    }

    /// The raw message channel (bypasses error tracking).
    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }
}

/// Chunk-local layer over the shared context.
///
/// Error state recorded here stays local to the chunk (so one chunk's
/// compile errors don't mark a sibling chunk failed) but still propagates up
/// to the shared layer for the final outcome.
pub struct ChunkContext {
    build: Arc<BuildContext>,
    chunk: TargetChunk,
    errors: Arc<AtomicBool>,
}

impl ChunkContext {
    pub fn new(build: Arc<BuildContext>, chunk: TargetChunk) -> Self {
        Self {
            build,
            chunk,
            errors: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared parent layer.
    pub fn build(&self) -> &Arc<BuildContext> {
        &self.build
    }

    /// The chunk being built.
    pub fn chunk(&self) -> &TargetChunk {
        &self.chunk
    }

    /// Chunk-local error flag, shared with the chunk's output sink.
    pub fn errors_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.errors)
    }

    /// Deliver a message; errors mark both the chunk layer and the parent.
    pub fn message(&self, message: BuildMessage) {
        if let BuildMessage::Compiler(ref compiler) = message
            && compiler.kind == MessageKind::Error
        {
            self.errors.store(true, Ordering::SeqCst);
        }
        self.build.message(message);
    }

    /// Shorthand for a compiler diagnostic.
    pub fn compiler_message(&self, message: CompilerMessage) {
        self.message(BuildMessage::Compiler(message));
    }

    /// Whether this chunk saw a compile error (local layer first; the
    /// parent's errors do not leak in).
    pub fn errors_detected(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation check.
    pub fn check_canceled(&self) -> BuildResult<()> {
        self.build.cancel.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CollectingSink;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> Arc<BuildContext> {
        let stores = Arc::new(BuildStores::open(&temp.path().join("data"), temp.path()).unwrap());
        let graph = Arc::new(DependencyGraph::open(&stores.graph_dir()).unwrap());
        Arc::new(BuildContext::new(
            Arc::new(Project::new(vec![])),
            CompileScope::incremental(),
            stores,
            Arc::new(FsState::new()),
            graph,
            Arc::new(CollectingSink::new()),
            CancelToken::new(),
        ))
    }

    #[test]
    fn chunk_errors_propagate_to_the_parent_but_not_between_chunks() {
        let temp = TempDir::new().unwrap();
        let build = context(&temp);
        let first = ChunkContext::new(Arc::clone(&build), TargetChunk { targets: vec![] });
        let second = ChunkContext::new(Arc::clone(&build), TargetChunk { targets: vec![] });

        first.compiler_message(CompilerMessage::error("kotlin", "boom"));

        assert!(first.errors_detected());
        assert!(!second.errors_detected());
        assert!(build.errors_detected());
    }

    #[test]
    fn cancel_token_fails_the_check() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(BuildError::Canceled)));
    }

    #[test]
    fn scope_forcing_is_per_chunk_all_or_nothing() {
        let scope = CompileScope::incremental().with_forced(vec![TargetId(1)]);
        let mixed = TargetChunk {
            targets: vec![TargetId(1), TargetId(2)],
        };
        assert!(!scope.is_chunk_forced(&mixed));
        assert!(scope.is_build_forced(TargetId(1)));
        assert!(!scope.is_fully_incremental());
    }
}
