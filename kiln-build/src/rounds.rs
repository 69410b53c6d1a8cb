//! The round-based builder loop: one chunk, repeated compiler passes until a
//! fixed point.

use crate::builder::{BuilderPass, PassExit};
use crate::context::{BuildContext, ChunkContext};
use crate::error::{BuildError, BuildResult};
use crate::extract::SymbolExtractor;
use crate::fs_state::{stamp_current_content, CompilationRound, DirtyFilesView};
use crate::graph::NodeSource;
use crate::messages::{BuildMessage, CompilerMessage};
use crate::output_sink::{ChunkOutputSink, OutputRecord};
use crate::target::{TargetChunk, TargetId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Build one chunk to its fixed point.
///
/// Returns whether any pass did work. Removed-source descriptors and stamps
/// are only committed when the chunk finishes without errors; on failure the
/// removed set is re-registered so the next invocation sees it again.
pub async fn build_chunk(
    cx: &ChunkContext,
    passes: &[Box<dyn BuilderPass>],
    extractor: &Arc<dyn SymbolExtractor>,
) -> BuildResult<bool> {
    let build = Arc::clone(cx.build());
    let chunk = cx.chunk().clone();
    let chunk_name = chunk.presentable_name(&build.project);
    let forced = build.scope.is_chunk_forced(&chunk);

    for id in &chunk.targets {
        let target = build
            .project
            .target(*id)
            .ok_or_else(|| BuildError::Internal(format!("unknown target {id}")))?;
        let stamps = build.stores.stamps_for(*id)?;
        build.fs_state.initialize(target, &stamps, forced)?;
    }

    build.progress(format!("building {chunk_name}"));
    for pass in passes {
        pass.chunk_build_started(cx);
    }

    let mut processed_removed: HashMap<TargetId, Vec<PathBuf>> = HashMap::new();
    let result = run_rounds(cx, passes, extractor, forced, &mut processed_removed).await;

    for pass in passes {
        pass.chunk_build_finished(cx);
    }

    let outcome = match result {
        Ok(RoundsOutcome {
            done_something,
            compiled,
        }) => {
            if cx.errors_detected() {
                cx.compiler_message(CompilerMessage::info(
                    "",
                    format!("errors occurred while compiling {chunk_name}"),
                ));
                restore_removed(cx, &mut processed_removed);
            } else if done_something {
                mark_targets_up_to_date(&build, &compiled, &processed_removed)?;
            }
            Ok(done_something)
        }
        Err(error) => {
            restore_removed(cx, &mut processed_removed);
            Err(error)
        }
    };

    build.fs_state.clear_round_data(&chunk);
    build.progress(format!("finished {chunk_name}"));
    outcome
}

struct RoundsOutcome {
    done_something: bool,
    // target -> sources compiled over all rounds
    compiled: HashMap<TargetId, BTreeSet<PathBuf>>,
}

async fn run_rounds(
    cx: &ChunkContext,
    passes: &[Box<dyn BuilderPass>],
    extractor: &Arc<dyn SymbolExtractor>,
    forced: bool,
    processed_removed: &mut HashMap<TargetId, Vec<PathBuf>>,
) -> BuildResult<RoundsOutcome> {
    let build = Arc::clone(cx.build());
    let chunk = cx.chunk().clone();
    let chunk_name = chunk.presentable_name(&build.project);

    let sink = ChunkOutputSink::new(Arc::clone(build.sink()), cx.errors_flag(), build.errors_flag());
    let mut done_something = false;
    let mut rebuild_requested = false;
    let mut compiled_total: HashMap<TargetId, BTreeSet<PathBuf>> = HashMap::new();
    let mut round = 0usize;

    loop {
        round += 1;
        cx.check_canceled()?;
        build.fs_state.before_round(&chunk);

        let (deleted_outputs, removed_this_round) = process_deleted_paths(cx, processed_removed)?;
        done_something |= deleted_outputs;

        let mut dirty = build.fs_state.dirty_view(&chunk);
        if !forced {
            if complete_recompiled_sources(&build, &chunk, &dirty)? {
                dirty = build.fs_state.dirty_view(&chunk);
            }
            clean_stale_outputs(cx, &dirty)?;
        }
        debug!(
            "round {round} of {chunk_name}: {} dirty files",
            dirty.file_count()
        );

        let mut next_pass_required = false;
        let mut restarting_chunk = false;

        'passes: for pass in passes {
            cx.check_canceled()?;
            sink.set_current_builder(Some(pass.name()));
            let processed_before = sink.processed_sources(pass.name());
            let start = Instant::now();
            let exit = pass.build(cx, &dirty, &sink).await;
            build.stats.record(
                pass.name(),
                start.elapsed().as_nanos() as u64,
                sink.processed_sources(pass.name())
                    .saturating_sub(processed_before),
            );
            sink.set_current_builder(None);

            match exit? {
                PassExit::NothingDone => {}
                PassExit::Ok => done_something = true,
                PassExit::Abort => {
                    return Err(BuildError::StopBuild {
                        builder: pass.name().to_owned(),
                        message: None,
                    });
                }
                PassExit::AdditionalPassRequired => next_pass_required = true,
                PassExit::ChunkRebuildRequired => {
                    if !rebuild_requested && !forced {
                        // allow a rebuild from scratch only once per chunk
                        rebuild_requested = true;
                        cx.compiler_message(CompilerMessage::info(
                            pass.name(),
                            format!(
                                "builder \"{}\" requested rebuild of chunk \"{chunk_name}\"",
                                pass.name()
                            ),
                        ));
                        build.fs_state.clear_round_data(&chunk);
                        let targets: Vec<&crate::target::BuildTarget> = build
                            .project
                            .targets()
                            .iter()
                            .map(|t| t.as_ref())
                            .collect();
                        build.fs_state.mark_chunk_dirty(
                            &chunk,
                            &targets,
                            CompilationRound::Next,
                        )?;
                        sink.clear();
                        compiled_total.clear();
                        next_pass_required = true;
                        restarting_chunk = true;
                        break 'passes;
                    }
                    debug!(
                        "builder {} requested second chunk rebuild; ignoring",
                        pass.name()
                    );
                }
            }
        }

        if !restarting_chunk {
            let records = sink.take_round_records();
            let removed_outputs = sink.take_removed();
            commit_round_mappings(&build, &records, &removed_outputs, &chunk)?;
            chain_generated_outputs(&build, &records);

            let mut compiled_this_round: BTreeSet<PathBuf> = BTreeSet::new();
            for record in &records {
                compiled_this_round.extend(record.sources.iter().cloned());
                compiled_total
                    .entry(record.target)
                    .or_default()
                    .extend(record.sources.iter().cloned());
            }
            for id in &chunk.targets {
                let files: Vec<PathBuf> = compiled_this_round.iter().cloned().collect();
                build.fs_state.clear_compiled(*id, &files);
            }

            let more = update_dependency_graph(
                cx,
                extractor,
                &records,
                &removed_this_round,
                &compiled_this_round,
            )
            .await?;
            if more {
                next_pass_required = true;
                done_something = true;
            }
        }

        if !next_pass_required {
            break;
        }
    }

    Ok(RoundsOutcome {
        done_something,
        compiled: compiled_total,
    })
}

// Delete on-disk outputs recorded for sources that were removed since the
// last build. Returns whether anything was deleted plus the sources handled
// this round.
fn process_deleted_paths(
    cx: &ChunkContext,
    processed: &mut HashMap<TargetId, Vec<PathBuf>>,
) -> BuildResult<(bool, Vec<(TargetId, PathBuf)>)> {
    let build = cx.build();
    let mut did_something = false;
    let mut this_round = Vec::new();

    for id in &cx.chunk().targets {
        let removed = build.fs_state.take_removed(*id);
        if removed.is_empty() {
            continue;
        }
        let map = build.stores.source_map_for(*id)?;
        let mut deleted_paths = Vec::new();

        for source in &removed {
            for output in map.outputs(source) {
                match std::fs::remove_file(&output) {
                    Ok(()) => {
                        did_something = true;
                        deleted_paths.push(output.display().to_string());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to delete output {}: {e}", output.display()),
                }
            }
        }

        if !deleted_paths.is_empty() {
            cx.message(BuildMessage::FilesDeleted(deleted_paths));
        }
        processed.entry(*id).or_default().extend(removed.clone());
        this_round.extend(removed.into_iter().map(|f| (*id, f)));
    }

    Ok((did_something, this_round))
}

// If an output file is generated from multiple sources, make sure all of
// them are recompiled together.
fn complete_recompiled_sources(
    build: &BuildContext,
    chunk: &TargetChunk,
    dirty: &DirtyFilesView,
) -> BuildResult<bool> {
    let mut added = false;
    for id in &chunk.targets {
        let dirty_files: BTreeSet<PathBuf> = dirty.dirty_for(*id).into_iter().collect();
        if dirty_files.is_empty() {
            continue;
        }
        let map = build.stores.source_map_for(*id)?;
        let mut affected_outputs: BTreeSet<PathBuf> = BTreeSet::new();
        for file in &dirty_files {
            affected_outputs.extend(map.outputs(file));
        }
        if affected_outputs.is_empty() {
            continue;
        }
        for source in map.sources_sharing_outputs(&affected_outputs) {
            if dirty_files.contains(&source) || !source.exists() {
                continue;
            }
            if let Some((target, root)) = build.project.find_owner(&source)
                && target.id() == *id
            {
                debug!(
                    "recompiling {} together with its output-sharing sources",
                    source.display()
                );
                build
                    .fs_state
                    .mark_dirty(*id, root.id, source, CompilationRound::Current);
                added = true;
            }
        }
    }
    Ok(added)
}

// Delete stale outputs of files about to be recompiled; whatever could not
// be deleted stays registered.
fn clean_stale_outputs(cx: &ChunkContext, dirty: &DirtyFilesView) -> BuildResult<()> {
    let build = cx.build();
    for id in &cx.chunk().targets {
        let map = build.stores.source_map_for(*id)?;
        for file in dirty.dirty_for(*id) {
            let outputs = map.outputs(&file);
            if outputs.is_empty() {
                continue;
            }
            let mut preserved = Vec::new();
            let mut deleted = Vec::new();
            for output in outputs {
                match std::fs::remove_file(&output) {
                    Ok(()) => deleted.push(output.display().to_string()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("failed to delete stale output {}: {e}", output.display());
                        preserved.push(output);
                    }
                }
            }
            if !preserved.is_empty() {
                info!(
                    "some outputs were not removed for {}: {} kept",
                    file.display(),
                    preserved.len()
                );
            }
            map.set_outputs(&file, &preserved);
            if !deleted.is_empty() {
                cx.message(BuildMessage::FilesDeleted(deleted));
            }
        }
    }
    Ok(())
}

// Commit the round's source→output registrations and explicit removals.
fn commit_round_mappings(
    build: &BuildContext,
    records: &[OutputRecord],
    removed_outputs: &[PathBuf],
    chunk: &TargetChunk,
) -> BuildResult<()> {
    for record in records {
        let map = build.stores.source_map_for(record.target)?;
        for source in &record.sources {
            map.append_output(source, &record.output);
        }
    }
    for output in removed_outputs {
        let _ = std::fs::remove_file(output);
        for id in &chunk.targets {
            let map = build.stores.source_map_for(*id)?;
            for (source, outputs) in map.entries() {
                if outputs.contains(output) {
                    map.remove_output(&source, output);
                }
            }
        }
    }
    Ok(())
}

// Outputs generated into another target's source root dirty that file in
// the other target (generated-source chaining).
fn chain_generated_outputs(build: &BuildContext, records: &[OutputRecord]) {
    for record in records {
        if let Some((target, root)) = build.project.find_owner(&record.output)
            && target.id() != record.target
        {
            debug!(
                "output {} landed in source root of {}; marking dirty",
                record.output.display(),
                target.name()
            );
            build.fs_state.mark_dirty(
                target.id(),
                root.id,
                record.output.clone(),
                CompilationRound::Current,
            );
        }
    }
}

// Feed freshly compiled artifacts through the differentiation engine, mark
// impacted files dirty for the next round, and integrate the delta when the
// round saw no compile errors.
async fn update_dependency_graph(
    cx: &ChunkContext,
    extractor: &Arc<dyn SymbolExtractor>,
    records: &[OutputRecord],
    removed: &[(TargetId, PathBuf)],
    compiled_this_round: &BTreeSet<PathBuf>,
) -> BuildResult<bool> {
    let build = cx.build();
    let relativizer = build.stores.relativizer();

    let mut by_source: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for record in records {
        for source in &record.sources {
            by_source
                .entry(source.clone())
                .or_default()
                .push(record.output.clone());
        }
    }

    let mut delta = build.graph.create_delta();
    for (source, outputs) in by_source {
        let mut nodes = Vec::new();
        for output in outputs {
            nodes.extend(extractor.extract(&output).await?);
        }
        delta.associate(NodeSource::from_path(relativizer, &source), nodes);
    }
    for (_, file) in removed {
        delta.mark_deleted(NodeSource::from_path(relativizer, file));
    }

    if delta.is_empty() {
        return Ok(false);
    }

    let diff = build.graph.differentiate(&delta)?;
    if !diff.is_incremental {
        return Err(BuildError::RebuildRequested(
            "dependency analysis cannot proceed incrementally".to_owned(),
        ));
    }

    let mut marked_in_chunk = false;
    for source in &diff.affected {
        let path = source.to_path(relativizer);
        if !path.exists() {
            continue;
        }
        let forced_together = diff.forced_together.contains(source);
        if compiled_this_round.contains(&path) && !forced_together {
            continue;
        }
        let Some((target, root)) = build.project.find_owner(&path) else {
            continue;
        };
        build
            .fs_state
            .mark_dirty(target.id(), root.id, path, CompilationRound::Next);
        if cx.chunk().contains(target.id()) {
            marked_in_chunk = true;
        }
    }

    if !cx.errors_detected() {
        build.graph.integrate(&delta)?;
    } else {
        debug!("compile errors in round; graph delta discarded");
    }

    Ok(marked_in_chunk)
}

// Commit stamps for compiled sources and drop descriptors of processed
// removed sources. Only called for an error-free chunk.
fn mark_targets_up_to_date(
    build: &BuildContext,
    compiled: &HashMap<TargetId, BTreeSet<PathBuf>>,
    processed_removed: &HashMap<TargetId, Vec<PathBuf>>,
) -> BuildResult<()> {
    for (target, files) in compiled {
        let stamps = build.stores.stamps_for(*target)?;
        for file in files {
            stamp_current_content(&stamps, file)?;
        }
    }
    for (target, files) in processed_removed {
        let stamps = build.stores.stamps_for(*target)?;
        let map = build.stores.source_map_for(*target)?;
        for file in files {
            stamps.remove(file);
            map.remove_source(file);
        }
    }
    Ok(())
}

// A failed or errored chunk restores its removed paths so the next build
// invocation processes them again.
fn restore_removed(cx: &ChunkContext, processed: &mut HashMap<TargetId, Vec<PathBuf>>) {
    let build = cx.build();
    for (target, files) in processed.drain() {
        if !files.is_empty() {
            build.fs_state.re_register_removed(target, files);
        }
    }
}
