//! Symbol extraction collaborator contract.

use crate::error::BuildResult;
use crate::graph::Node;
use async_trait::async_trait;
use std::path::Path;

/// Extracts graph nodes from a compiled artifact.
///
/// Used in two places: post-compile on outputs registered by builder passes,
/// and pre-build on changed library artifacts. The implementation lives with
/// the language front end, outside the orchestrator core.
#[async_trait]
pub trait SymbolExtractor: Send + Sync {
    /// Yield the nodes found in one artifact. An artifact carrying no
    /// symbol information (a copied resource, say) yields an empty vec.
    async fn extract(&self, artifact: &Path) -> BuildResult<Vec<Node>>;
}
