//! Top-level incremental builder: wires the stores, the library check, the
//! chunk scheduler and the round loop together, and maps every failure onto
//! the caller-facing outcome surface.

use crate::builder::BuilderPass;
use crate::context::{BuildContext, CancelToken, ChunkContext, CompileScope};
use crate::error::{BuildError, BuildResult};
use crate::extract::SymbolExtractor;
use crate::graph::DependencyGraph;
use crate::libraries::{check_library_dependencies, commit_library_state};
use crate::messages::{BuildMessage, CompilerMessage, MessageSink};
use crate::rounds::build_chunk;
use crate::scheduler::{ChunkGraph, ChunkScheduler};
use crate::stores::BuildStores;
use crate::target::Project;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Build configuration supplied by the embedding tool.
pub struct BuildOptions {
    /// Directory holding all persistent build data.
    pub data_dir: PathBuf,

    /// Project root; store keys are relativized against it.
    pub project_root: PathBuf,

    /// External library artifacts on the compilation classpath.
    pub classpath: Vec<PathBuf>,

    /// Maximum chunks building concurrently.
    pub max_parallel_chunks: usize,

    /// Whether the "too many dirty targets" heuristic may escalate an
    /// incremental request to a full rebuild. Disabled by tests.
    pub rebuild_heuristic: bool,
}

impl BuildOptions {
    pub fn new(data_dir: PathBuf, project_root: PathBuf) -> Self {
        Self {
            data_dir,
            project_root,
            classpath: Vec::new(),
            max_parallel_chunks: num_cpus::get(),
            rebuild_heuristic: true,
        }
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Everything compiled; persisted state is up to date.
    Success,

    /// Errors were reported through the message channel.
    ErrorsReported,

    /// Persisted state is unusable (or the change set too structural); the
    /// caller must retry with a full, non-incremental build.
    RebuildRequested {
        reason: String,
    },
}

impl BuildOutcome {
    /// Conventional process exit code; check [`Self::is_rebuild_requested`]
    /// first, since a rebuild request is a retry condition rather than a
    /// plain failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildOutcome::Success => 0,
            BuildOutcome::ErrorsReported | BuildOutcome::RebuildRequested { .. } => 1,
        }
    }

    pub fn is_rebuild_requested(&self) -> bool {
        matches!(self, BuildOutcome::RebuildRequested { .. })
    }
}

/// The incremental build orchestrator for one project.
pub struct IncrementalBuilder {
    project: Arc<Project>,
    passes: Arc<Vec<Box<dyn BuilderPass>>>,
    extractor: Arc<dyn SymbolExtractor>,
    sink: Arc<dyn MessageSink>,
    options: BuildOptions,
}

impl IncrementalBuilder {
    pub fn new(
        project: Project,
        passes: Vec<Box<dyn BuilderPass>>,
        extractor: Arc<dyn SymbolExtractor>,
        sink: Arc<dyn MessageSink>,
        options: BuildOptions,
    ) -> Self {
        Self {
            project: Arc::new(project),
            passes: Arc::new(passes),
            extractor,
            sink,
            options,
        }
    }

    /// Run one build invocation.
    pub async fn build(&self, scope: CompileScope, cancel: CancelToken) -> BuildOutcome {
        let stores = match BuildStores::open(&self.options.data_dir, &self.options.project_root) {
            Ok(stores) => Arc::new(stores),
            Err(e) => return rebuild_requested(format!("cannot open build stores: {e}")),
        };
        let graph = match DependencyGraph::open(&stores.graph_dir()) {
            Ok(graph) => Arc::new(graph),
            Err(e) => return rebuild_requested(format!("cannot open dependency graph: {e}")),
        };

        let cx = Arc::new(BuildContext::new(
            Arc::clone(&self.project),
            scope,
            stores,
            Arc::new(crate::fs_state::FsState::new()),
            graph,
            Arc::clone(&self.sink),
            cancel,
        ));

        let result = self.run_build(&cx).await;

        match result {
            Ok(()) => {
                if let Err(e) = cx.stores.save_all().and_then(|()| cx.graph.close()) {
                    cx.graph.force_close();
                    return rebuild_requested(format!("flushing build data failed: {e}"));
                }
                if cx.errors_detected() {
                    BuildOutcome::ErrorsReported
                } else {
                    BuildOutcome::Success
                }
            }
            Err(BuildError::Canceled) => {
                cx.progress("build canceled");
                let _ = cx.stores.save_all();
                let _ = cx.graph.close();
                BuildOutcome::ErrorsReported
            }
            Err(BuildError::StopBuild { builder, message }) => {
                cx.message(BuildMessage::Compiler(CompilerMessage::error(
                    builder.clone(),
                    message.unwrap_or_else(|| {
                        format!("builder \"{builder}\" requested build stop")
                    }),
                )));
                let _ = cx.stores.save_all();
                let _ = cx.graph.close();
                BuildOutcome::ErrorsReported
            }
            Err(BuildError::RebuildRequested(reason)) => {
                cx.message(BuildMessage::Compiler(CompilerMessage::info(
                    "",
                    format!("forcing project rebuild: {reason}"),
                )));
                cx.graph.force_close();
                BuildOutcome::RebuildRequested { reason }
            }
            Err(BuildError::Storage(e)) => {
                // caches corrupted or outdated: never retried in place
                cx.message(BuildMessage::Compiler(CompilerMessage::info(
                    "",
                    format!("internal caches are corrupted or have outdated format, forcing project rebuild: {e}"),
                )));
                cx.graph.force_close();
                BuildOutcome::RebuildRequested {
                    reason: e.to_string(),
                }
            }
            Err(other) => {
                cx.message(BuildMessage::Compiler(CompilerMessage::error(
                    "",
                    other.to_string(),
                )));
                let _ = cx.stores.save_all();
                let _ = cx.graph.close();
                BuildOutcome::ErrorsReported
            }
        }
    }

    async fn run_build(&self, cx: &Arc<BuildContext>) -> BuildResult<()> {
        cx.cancel.check()?;

        if self.options.rebuild_heuristic && cx.scope.is_fully_incremental() {
            self.check_rebuild_required(cx)?;
        }

        for pass in self.passes.iter() {
            pass.build_started(cx);
        }
        let result = self.run_targets(cx).await;
        for pass in self.passes.iter() {
            pass.build_finished(cx);
        }
        cx.stats.report(cx.sink().as_ref());
        result
    }

    async fn run_targets(&self, cx: &Arc<BuildContext>) -> BuildResult<()> {
        let clean_start = Instant::now();
        self.clear_forced_outputs(cx).await?;
        debug!("cleaned forced output roots in {:?}", clean_start.elapsed());

        let library_check =
            check_library_dependencies(cx, &self.options.classpath, &self.extractor).await?;

        let chunk_graph = ChunkGraph::build(&cx.project);
        let scheduler =
            ChunkScheduler::with_parallelism(chunk_graph, self.options.max_parallel_chunks);

        let build_start = Instant::now();
        let ctx = Arc::clone(cx);
        let passes = Arc::clone(&self.passes);
        let extractor = Arc::clone(&self.extractor);
        scheduler
            .run(move |chunk| {
                let cx = Arc::clone(&ctx);
                let passes = Arc::clone(&passes);
                let extractor = Arc::clone(&extractor);
                async move {
                    if !cx.scope.is_chunk_affected(&chunk) {
                        // skipped scopes still unblock their dependents
                        debug!("chunk {} not affected; skipping", chunk.presentable_name(&cx.project));
                        return Ok(());
                    }
                    cx.cancel.check()?;
                    let chunk_cx = ChunkContext::new(Arc::clone(&cx), chunk.clone());
                    let chunk_start = Instant::now();
                    let done = build_chunk(&chunk_cx, &passes, &extractor).await?;
                    if done && !chunk_cx.errors_detected() {
                        for id in &chunk.targets {
                            if let Some(target) = cx.project.target(*id) {
                                cx.stores
                                    .targets_state()
                                    .record_build(target.name(), chunk_start.elapsed());
                            }
                        }
                    }
                    Ok(())
                }
            })
            .await?;

        // files dirtied after their chunk already finished wait for the
        // next invocation
        for target in cx.project.targets() {
            if cx.fs_state.has_unprocessed_changes(target.id()) {
                cx.progress("some files changed during the build; they will be compiled by the next build");
                break;
            }
        }

        if !cx.errors_detected() {
            commit_library_state(cx, &library_check)?;
        }

        if cx.scope.is_full_rebuild() && !cx.errors_detected() && !cx.cancel.is_canceled() {
            cx.stores
                .targets_state()
                .set_last_successful_rebuild(build_start.elapsed());
        }
        Ok(())
    }

    // Estimate the linear build time of all dirty targets; when it reaches
    // 95% of the last successful full rebuild, an incremental build is not
    // worth it.
    fn check_rebuild_required(&self, cx: &Arc<BuildContext>) -> BuildResult<()> {
        let state = cx.stores.targets_state();
        let threshold = state.last_successful_rebuild_ms() * 95 / 100;
        if threshold == 0 {
            debug!("rebuild heuristic: no stats available");
            return Ok(());
        }

        for target in cx.project.targets() {
            let stamps = cx.stores.stamps_for(target.id())?;
            cx.fs_state.initialize(target, &stamps, false)?;
        }

        let mut estimated = 0u64;
        let mut affected = 0usize;
        for target in cx.project.targets() {
            let average = state.average_build_time_ms(target.name());
            if average > 0 && cx.fs_state.has_unprocessed_changes(target.id()) {
                estimated += average;
                affected += 1;
            }
        }
        info!("rebuild heuristic: {affected} dirty targets, estimated {estimated} ms / threshold {threshold} ms");

        if estimated >= threshold {
            let text = "too many targets require recompilation, forcing full project rebuild";
            cx.message(BuildMessage::Compiler(CompilerMessage::info("", text)));
            return Err(BuildError::RebuildRequested(text.to_owned()));
        }
        Ok(())
    }

    // Forced targets drop every recorded output before the build starts.
    async fn clear_forced_outputs(&self, cx: &Arc<BuildContext>) -> BuildResult<()> {
        let mut doomed = Vec::new();
        for target in cx.project.targets() {
            if !cx.scope.is_build_forced(target.id()) {
                continue;
            }
            let map = cx.stores.source_map_for(target.id())?;
            for (source, outputs) in map.entries() {
                map.remove_source(&source);
                doomed.extend(outputs);
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let deleted: Vec<String> = join_all(doomed.into_iter().map(|path| async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Some(path.display().to_string()),
                Err(_) => None,
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        if !deleted.is_empty() {
            cx.message(BuildMessage::FilesDeleted(deleted));
        }
        Ok(())
    }
}

fn rebuild_requested(reason: String) -> BuildOutcome {
    BuildOutcome::RebuildRequested { reason }
}
