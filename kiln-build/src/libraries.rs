//! External library dependency tracking.
//!
//! Changed library artifacts are scanned for their public symbols, turned
//! into nodes attributed to one NodeSource per artifact, and fed through the
//! same differentiate/integrate pipeline as project sources. A filter keeps
//! library-sourced changes from marking other libraries dirty; only project
//! sources are impacted.

use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::extract::SymbolExtractor;
use crate::fs_state::CompilationRound;
use crate::graph::{Delta, Node, NodeSource};
use kiln_storage::ContentHash;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

// backpressure bound for concurrent artifact extraction
const EXTRACTION_QUEUE: usize = 8;

/// Lifecycle state of one tracked library artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryState {
    New,
    Changed,
    Deleted,
    Unchanged,
}

/// Per-library-file record.
#[derive(Debug, Clone)]
pub struct DependencyDescriptor {
    pub path: PathBuf,
    pub state: LibraryState,
    pub digest: Option<ContentHash>,
}

/// Outcome of the pre-build library check, held until the build succeeds.
pub struct LibraryCheck {
    /// Delta of library nodes, integrated only after a successful build.
    pub delta: Delta,

    /// Descriptors for every changed or new artifact, carrying the digest
    /// to commit into the roots store on success.
    pub descriptors: Vec<DependencyDescriptor>,

    /// Project sources impacted by the library changes.
    pub affected: BTreeSet<NodeSource>,
}

impl LibraryCheck {
    /// A check that found nothing to do.
    pub fn unchanged() -> Self {
        Self {
            delta: Delta::default(),
            descriptors: Vec::new(),
            affected: BTreeSet::new(),
        }
    }
}

/// Diff the classpath against the library-roots store and differentiate the
/// changes, marking impacted project sources dirty for the build.
///
/// Strategy: descriptors are iterated explicitly; a `Deleted` root is too
/// structural to handle file-by-file and escalates to rebuild-requested,
/// while `New`/`Changed` roots go through incremental differentiation.
pub async fn check_library_dependencies(
    cx: &BuildContext,
    classpath: &[PathBuf],
    extractor: &Arc<dyn SymbolExtractor>,
) -> BuildResult<LibraryCheck> {
    let diff = cx.stores.library_roots().diff(classpath)?;
    if diff.is_empty() {
        debug!("library roots unchanged");
        return Ok(LibraryCheck::unchanged());
    }

    if let Some(deleted) = diff.deleted.first() {
        return Err(BuildError::RebuildRequested(format!(
            "library root {} was removed from the classpath",
            deleted.display()
        )));
    }

    let relativizer = Arc::clone(cx.stores.relativizer());
    let library_sources: BTreeSet<NodeSource> = diff
        .changed
        .iter()
        .map(|path| NodeSource::from_path(&relativizer, path))
        .collect();

    // one producer per changed artifact, a single consumer applying results
    // to the delta; the BTreeMap inside the delta keeps mutation order
    // deterministic regardless of extraction completion order
    let (tx, mut rx) = mpsc::channel::<(PathBuf, ContentHash, Vec<Node>)>(EXTRACTION_QUEUE);
    let mut producers: JoinSet<BuildResult<()>> = JoinSet::new();

    for artifact in diff.changed.clone() {
        let tx = tx.clone();
        let extractor = Arc::clone(extractor);
        let cancel = cx.cancel.clone();
        let _ = producers.spawn(async move {
            cancel.check()?;
            let digest = ContentHash::from_file(&artifact)?;
            let nodes = extractor.extract(&artifact).await?;
            tx.send((artifact, digest, nodes))
                .await
                .map_err(|_| BuildError::Canceled)?;
            Ok(())
        });
    }
    drop(tx);

    let mut delta = cx.graph.create_delta();
    let mut descriptors = Vec::new();
    while let Some((artifact, digest, nodes)) = rx.recv().await {
        let known = cx.stores.library_roots().get(&artifact).is_some();
        descriptors.push(DependencyDescriptor {
            path: artifact.clone(),
            state: if known {
                LibraryState::Changed
            } else {
                LibraryState::New
            },
            digest: Some(digest),
        });
        delta.associate(NodeSource::from_path(&relativizer, &artifact), nodes);
    }

    while let Some(joined) = producers.join_next().await {
        match joined {
            Ok(result) => result?,
            Err(join_error) => {
                return Err(BuildError::Internal(format!(
                    "library extraction task panicked: {join_error}"
                )));
            }
        }
    }

    let diff_result = cx
        .graph
        .differentiate_filtered(&delta, &|source| !library_sources.contains(source))?;
    if !diff_result.is_incremental {
        return Err(BuildError::RebuildRequested(
            "library change cannot be handled incrementally".to_owned(),
        ));
    }

    for source in &diff_result.affected {
        let path = source.to_path(&relativizer);
        if !path.exists() {
            continue;
        }
        let Some((target, root)) = cx.project.find_owner(&path) else {
            continue;
        };
        cx.fs_state
            .mark_dirty(target.id(), root.id, path, CompilationRound::Current);
    }

    info!(
        "library check: {} artifacts changed, {} project sources affected",
        descriptors.len(),
        diff_result.affected.len()
    );

    Ok(LibraryCheck {
        delta,
        descriptors,
        affected: diff_result.affected,
    })
}

/// Commit a successful build's library state: integrate the node delta and
/// record the new root digests. Never called on failure, so in-flight
/// library state is not committed when a build is canceled or errors out.
pub fn commit_library_state(cx: &BuildContext, check: &LibraryCheck) -> BuildResult<()> {
    if check.delta.is_empty() && check.descriptors.is_empty() {
        return Ok(());
    }
    cx.graph.integrate(&check.delta)?;
    for descriptor in &check.descriptors {
        if let Some(digest) = &descriptor.digest {
            cx.stores
                .library_roots()
                .update(&descriptor.path, digest.clone());
        }
    }
    Ok(())
}
