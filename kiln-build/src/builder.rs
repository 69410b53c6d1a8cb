//! The builder-pass collaborator contract.

use crate::context::{BuildContext, ChunkContext};
use crate::error::BuildResult;
use crate::fs_state::DirtyFilesView;
use crate::output_sink::ChunkOutputSink;
use async_trait::async_trait;

/// What a builder pass did with the round it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassExit {
    /// Nothing to do for this pass.
    NothingDone,

    /// Work was performed.
    Ok,

    /// Stop the whole build and report an error.
    Abort,

    /// Schedule another round after this one completes.
    AdditionalPassRequired,

    /// Escalate: mark the entire chunk dirty and restart from round one.
    /// Honored at most once per chunk in incremental mode.
    ChunkRebuildRequired,
}

/// A compiler front-end adapter.
///
/// The orchestrator hands each pass the current round's dirty-file view and
/// an output-registration sink; the pass compiles what it cares about,
/// registers whatever artifacts it produced and reports how the round went.
/// One await point per external compiler call; a suspended pass must not
/// re-enter the dirty-state tracker.
#[async_trait]
pub trait BuilderPass: Send + Sync {
    /// Stable, human-readable pass name (used in messages and statistics).
    fn name(&self) -> &str;

    /// Compile the current round's dirty files.
    async fn build(
        &self,
        cx: &ChunkContext,
        dirty: &DirtyFilesView,
        out: &ChunkOutputSink,
    ) -> BuildResult<PassExit>;

    /// Called once when the whole build starts.
    fn build_started(&self, _cx: &BuildContext) {}

    /// Called once when the whole build finishes, success or not.
    fn build_finished(&self, _cx: &BuildContext) {}

    /// Called before the first round of each chunk.
    fn chunk_build_started(&self, _cx: &ChunkContext) {}

    /// Called after the last round of each chunk.
    fn chunk_build_finished(&self, _cx: &ChunkContext) {}
}
