//! Scripted compiler pass and symbol extractor for end-to-end tests.

use async_trait::async_trait;
use kiln_build::{
    BuildResult, BuilderPass, ChunkContext, ChunkOutputSink, DirtyFilesView, Node, NodeId,
    OutputSink, PassExit, SymbolExtractor, Usage,
};
use kiln_storage::ContentHash;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Build a node with plain member signatures and usages.
pub fn class(name: &str, members: &[(&str, &str)], usages: &[Usage]) -> Node {
    Node::new(
        NodeId::new(name),
        members
            .iter()
            .map(|(n, sig)| ((*n).to_owned(), ContentHash::from_bytes(sig.as_bytes())))
            .collect::<BTreeMap<_, _>>(),
        BTreeSet::new(),
        false,
        usages.iter().cloned().collect(),
    )
}

/// Shared artifact → nodes registry connecting the scripted compiler with
/// the extractor, in place of real class-file parsing.
#[derive(Default)]
pub struct ArtifactRegistry {
    nodes: Mutex<HashMap<PathBuf, Vec<Node>>>,
}

impl ArtifactRegistry {
    pub fn set(&self, artifact: PathBuf, nodes: Vec<Node>) {
        let _ = self.nodes.lock().unwrap().insert(artifact, nodes);
    }

    pub fn get(&self, artifact: &Path) -> Vec<Node> {
        self.nodes
            .lock()
            .unwrap()
            .get(artifact)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct RegistryExtractor(pub Arc<ArtifactRegistry>);

#[async_trait]
impl SymbolExtractor for RegistryExtractor {
    async fn extract(&self, artifact: &Path) -> BuildResult<Vec<Node>> {
        Ok(self.0.get(artifact))
    }
}

/// A compiler pass scripted by the test: each dirty source produces one
/// `<stem>.class` output carrying the nodes configured for that source.
pub struct ScriptedCompiler {
    name: String,
    registry: Arc<ArtifactRegistry>,
    specs: Mutex<HashMap<PathBuf, Vec<Node>>>,
    compiled: Mutex<Vec<PathBuf>>,
}

impl ScriptedCompiler {
    pub fn new(name: &str, registry: Arc<ArtifactRegistry>) -> Self {
        Self {
            name: name.to_owned(),
            registry,
            specs: Mutex::new(HashMap::new()),
            compiled: Mutex::new(Vec::new()),
        }
    }

    /// Configure the symbols a source compiles to.
    pub fn set_nodes(&self, source: PathBuf, nodes: Vec<Node>) {
        let _ = self.specs.lock().unwrap().insert(source, nodes);
    }

    /// Claim the sources compiled since the last call.
    pub fn take_compiled(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.compiled.lock().unwrap())
    }
}

/// Lets a test keep a handle on a pass after handing it to the builder.
pub struct SharedPass<P>(pub Arc<P>);

#[async_trait]
impl<P: BuilderPass> BuilderPass for SharedPass<P> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn build(
        &self,
        cx: &ChunkContext,
        dirty: &DirtyFilesView,
        out: &ChunkOutputSink,
    ) -> BuildResult<PassExit> {
        self.0.build(cx, dirty, out).await
    }
}

#[async_trait]
impl BuilderPass for ScriptedCompiler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(
        &self,
        cx: &ChunkContext,
        dirty: &DirtyFilesView,
        out: &ChunkOutputSink,
    ) -> BuildResult<PassExit> {
        let mut did_work = false;
        for id in &cx.chunk().targets {
            let Some(target) = cx.build().project.target(*id).cloned() else {
                continue;
            };
            for source in dirty.dirty_for(*id) {
                let stem = source
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let output = target.output_dir().join(format!("{stem}.class"));
                std::fs::create_dir_all(target.output_dir())?;
                std::fs::write(&output, format!("compiled from {}", source.display()))?;

                let nodes = self
                    .specs
                    .lock()
                    .unwrap()
                    .get(&source)
                    .cloned()
                    .unwrap_or_default();
                self.registry.set(output.clone(), nodes);
                out.register_output(*id, &output, std::slice::from_ref(&source));
                self.compiled.lock().unwrap().push(source);
                did_work = true;
            }
        }
        Ok(if did_work {
            PassExit::Ok
        } else {
            PassExit::NothingDone
        })
    }
}
