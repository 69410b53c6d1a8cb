//! Transient, not-yet-committed graph changes for one build.

use super::node::{Node, NodeSource};
use std::collections::{BTreeMap, BTreeSet};

/// The set of graph changes accumulated during one build: freshly extracted
/// nodes for changed sources, and sources confirmed deleted.
///
/// A delta is either integrated into the persistent graph after an
/// error-free round, or discarded.
#[derive(Debug, Default)]
pub struct Delta {
    changed: BTreeMap<NodeSource, Vec<Node>>,
    deleted: BTreeSet<NodeSource>,
}

impl Delta {
    /// Record the nodes freshly extracted for a compiled source.
    ///
    /// Later associations for the same source extend the node list, so a
    /// source producing several artifacts accumulates all of them.
    pub fn associate(&mut self, source: NodeSource, nodes: Vec<Node>) {
        self.changed.entry(source).or_default().extend(nodes);
    }

    /// Record a source as deleted.
    pub fn mark_deleted(&mut self, source: NodeSource) {
        let _ = self.changed.remove(&source);
        let _ = self.deleted.insert(source);
    }

    /// Changed sources with their new nodes, in stable order.
    pub fn changed(&self) -> &BTreeMap<NodeSource, Vec<Node>> {
        &self.changed
    }

    /// Deleted sources, in stable order.
    pub fn deleted(&self) -> &BTreeSet<NodeSource> {
        &self.deleted
    }

    /// All sources this delta touches.
    pub fn sources(&self) -> impl Iterator<Item = &NodeSource> {
        self.changed.keys().chain(self.deleted.iter())
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}
