//! Class-level dependency graph: node model, per-build delta and the
//! differentiation engine that turns "this symbol changed" into "these
//! files must recompile".

pub mod delta;
pub mod differentiate;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod node;

pub use delta::Delta;
pub use differentiate::{classify_change, DifferentiateResult, NodeChange};
pub use graph::DependencyGraph;
pub use node::{Node, NodeId, NodeSource, Usage};
