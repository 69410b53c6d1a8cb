//! Target-chunk scheduling: SCC chunking plus dependency-ordered parallel
//! execution.

use crate::error::{BuildError, BuildResult};
use crate::target::{Project, TargetChunk, TargetId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// The condensed chunk graph: one node per group of mutually-cyclic targets,
/// edges following the target dependency relation.
#[derive(Debug)]
pub struct ChunkGraph {
    chunks: Vec<TargetChunk>,
    // chunk index -> indices of chunks it depends on
    dependencies: Vec<HashSet<usize>>,
    // chunk index -> indices of chunks depending on it
    dependents: Vec<Vec<usize>>,
}

impl ChunkGraph {
    /// Condense the target dependency graph into chunks.
    ///
    /// Mutually-cyclic targets land in one chunk; chunk order is
    /// topologically consistent (dependencies before dependents).
    pub fn build(project: &Project) -> Self {
        let sccs = strongly_connected_components(project);

        let mut component_of: HashMap<TargetId, usize> = HashMap::new();
        for (index, scc) in sccs.iter().enumerate() {
            for id in scc {
                let _ = component_of.insert(*id, index);
            }
        }

        let mut dependencies: Vec<HashSet<usize>> = vec![HashSet::new(); sccs.len()];
        for target in project.targets() {
            let from = component_of[&target.id()];
            for dep in target.depends_on() {
                if let Some(&to) = component_of.get(dep)
                    && to != from
                {
                    let _ = dependencies[from].insert(to);
                }
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); sccs.len()];
        for (chunk, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                dependents[*dep].push(chunk);
            }
        }

        let chunks = sccs
            .into_iter()
            .map(|targets| TargetChunk { targets })
            .collect();

        Self {
            chunks,
            dependencies,
            dependents,
        }
    }

    /// The chunks in topologically consistent order.
    pub fn chunks(&self) -> &[TargetChunk] {
        &self.chunks
    }
}

// Tarjan's algorithm. Recursion follows depends_on edges, so a component is
// emitted only after every component it depends on; the output is already
// dependencies-first.
fn strongly_connected_components(project: &Project) -> Vec<Vec<TargetId>> {
    struct State {
        index: u32,
        indices: HashMap<TargetId, u32>,
        low_links: HashMap<TargetId, u32>,
        on_stack: HashSet<TargetId>,
        stack: Vec<TargetId>,
        components: Vec<Vec<TargetId>>,
    }

    fn visit(node: TargetId, project: &Project, state: &mut State) {
        let _ = state.indices.insert(node, state.index);
        let _ = state.low_links.insert(node, state.index);
        state.index += 1;
        state.stack.push(node);
        let _ = state.on_stack.insert(node);

        if let Some(target) = project.target(node) {
            for dep in target.depends_on() {
                if project.target(*dep).is_none() {
                    continue;
                }
                if !state.indices.contains_key(dep) {
                    visit(*dep, project, state);
                    let low = state.low_links[&node].min(state.low_links[dep]);
                    let _ = state.low_links.insert(node, low);
                } else if state.on_stack.contains(dep) {
                    let low = state.low_links[&node].min(state.indices[dep]);
                    let _ = state.low_links.insert(node, low);
                }
            }
        }

        if state.low_links[&node] == state.indices[&node] {
            let mut component = Vec::new();
            while let Some(top) = state.stack.pop() {
                let _ = state.on_stack.remove(&top);
                component.push(top);
                if top == node {
                    break;
                }
            }
            component.sort();
            state.components.push(component);
        }
    }

    let mut state = State {
        index: 0,
        indices: HashMap::new(),
        low_links: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        components: Vec::new(),
    };

    for target in project.targets() {
        if !state.indices.contains_key(&target.id()) {
            visit(target.id(), project, &mut state);
        }
    }

    state.components
}

/// Runs chunk tasks concurrently, honoring the dependency order.
pub struct ChunkScheduler {
    graph: ChunkGraph,
    max_parallel: usize,
}

impl ChunkScheduler {
    pub fn new(graph: ChunkGraph) -> Self {
        Self::with_parallelism(graph, num_cpus::get())
    }

    pub fn with_parallelism(graph: ChunkGraph, max_parallel: usize) -> Self {
        Self {
            graph,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Execute every chunk through `run_chunk`.
    ///
    /// A chunk starts only after all its dependency chunks completed. A
    /// failing chunk stops new chunks from starting; chunks already running
    /// drain before the first failure is surfaced.
    pub async fn run<F, Fut>(&self, run_chunk: F) -> BuildResult<()>
    where
        F: Fn(TargetChunk) -> Fut,
        Fut: Future<Output = BuildResult<()>> + Send + 'static,
    {
        let chunk_count = self.graph.chunks.len();
        let mut remaining: Vec<usize> =
            self.graph.dependencies.iter().map(HashSet::len).collect();
        let mut ready: VecDeque<usize> = (0..chunk_count)
            .filter(|&index| remaining[index] == 0)
            .collect();
        let mut tasks: JoinSet<(usize, BuildResult<()>)> = JoinSet::new();
        let mut running = 0usize;
        let mut completed = 0usize;
        let mut triggered: HashSet<usize> = ready.iter().copied().collect();
        let mut first_error: Option<BuildError> = None;

        info!(
            "scheduling {chunk_count} chunks, up to {} in parallel",
            self.max_parallel
        );

        loop {
            while first_error.is_none()
                && running < self.max_parallel
                && let Some(index) = ready.pop_front()
            {
                let chunk = self.graph.chunks[index].clone();
                let future = run_chunk(chunk);
                let _ = tasks.spawn(async move { (index, future.await) });
                running += 1;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            running -= 1;

            match joined {
                Err(join_error) => {
                    let _ = first_error.get_or_insert(BuildError::Internal(format!(
                        "chunk task panicked: {join_error}"
                    )));
                }
                Ok((index, Ok(()))) => {
                    completed += 1;
                    for &dependent in &self.graph.dependents[index] {
                        debug_assert!(remaining[dependent] > 0, "dependent decremented twice");
                        remaining[dependent] -= 1;
                        if remaining[dependent] == 0 {
                            // transitions to ready exactly once
                            let newly_ready = triggered.insert(dependent);
                            debug_assert!(newly_ready, "chunk re-triggered after completion");
                            ready.push_back(dependent);
                        }
                    }
                }
                Ok((_, Err(error))) => {
                    let _ = first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        if completed < chunk_count {
            // all ready work ran but some chunks never unblocked
            return Err(BuildError::Internal(
                "chunk graph deadlock: no tasks ready but build incomplete".to_owned(),
            ));
        }

        debug!("all {chunk_count} chunks completed");
        Ok(())
    }
}
