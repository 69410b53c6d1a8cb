//! The persisted whole-program dependency graph.
//!
//! Three stores under one directory: node data per source, a usage index
//! (who references a symbol, at which granularity) and a definition index
//! (which source defines a symbol). `create_delta`, `differentiate` and
//! `integrate` are mutually exclusive: one build's graph mutations never
//! interleave with another's.

use super::delta::Delta;
use super::differentiate::{classify_change, DifferentiateResult, NodeChange};
use super::node::{Node, NodeId, NodeSource};
use kiln_storage::{CachedKvStore, FileKvStore, FileMultiMapStore, KeyValueStore, StorageResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

// usage-index key spaces: any usage / whole-symbol usage / one member
fn all_key(id: &NodeId) -> String {
    format!("all:{id}")
}

fn whole_key(id: &NodeId) -> String {
    format!("whole:{id}")
}

fn member_key(id: &NodeId, member: &str) -> String {
    format!("member:{id}#{member}")
}

struct GraphStores {
    nodes: CachedKvStore<FileKvStore<Vec<Node>>, Vec<Node>>,
    usages: FileMultiMapStore<String>,
    defs: FileMultiMapStore<String>,
}

/// Persistent class-level dependency graph.
pub struct DependencyGraph {
    inner: Mutex<GraphStores>,
}

impl DependencyGraph {
    /// Open (or create) the graph storage under the given directory.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        Ok(Self {
            inner: Mutex::new(GraphStores {
                nodes: CachedKvStore::new(FileKvStore::open(dir.join("nodes"))?),
                usages: FileMultiMapStore::open(dir.join("usages"))?,
                defs: FileMultiMapStore::open(dir.join("defs"))?,
            }),
        })
    }

    /// Start collecting changes for this build.
    pub fn create_delta(&self) -> Delta {
        Delta::default()
    }

    /// Compute the sources impacted by a delta without touching the graph.
    pub fn differentiate(&self, delta: &Delta) -> StorageResult<DifferentiateResult> {
        self.differentiate_filtered(delta, &|_| true)
    }

    /// Differentiate, retaining only affected sources accepted by `keep`.
    ///
    /// Library differentiation passes a predicate rejecting library sources
    /// so a changed artifact can never mark another library dirty.
    pub fn differentiate_filtered(
        &self,
        delta: &Delta,
        keep: &dyn Fn(&NodeSource) -> bool,
    ) -> StorageResult<DifferentiateResult> {
        let mut stores = self.lock();
        let delta_sources: BTreeSet<NodeSource> = delta.sources().cloned().collect();

        let mut result = DifferentiateResult::incremental();

        for (source, new_nodes) in delta.changed() {
            let mut old_by_id: BTreeMap<NodeId, Node> = stores
                .nodes
                .get(source.as_str())?
                .unwrap_or_default()
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect();

            for new in new_nodes {
                // A symbol now defined here but still recorded for another
                // live source cannot be attributed file-by-file.
                let mut other_defs = stores.defs.get(new.id.as_str())?;
                let _ = other_defs.remove(source.as_str());
                other_defs.retain(|d| !delta_sources.contains(&NodeSource::from_key(d.clone())));
                if !other_defs.is_empty() && !old_by_id.contains_key(&new.id) {
                    warn!(
                        "symbol {} moved into {source} while still defined elsewhere; \
                         requesting non-incremental rebuild",
                        new.id
                    );
                    result.is_incremental = false;
                }

                let Some(old) = old_by_id.remove(&new.id) else {
                    // newly added symbol: no pre-existing users to impact
                    continue;
                };

                match classify_change(&old, new) {
                    NodeChange::Unchanged => {}
                    NodeChange::Members(changed_members) => {
                        let mut impacted = stores.usages.get(&whole_key(&new.id))?;
                        for member in &changed_members {
                            impacted.extend(stores.usages.get(&member_key(&new.id, member))?);
                        }
                        record_impact(
                            &mut result,
                            impacted,
                            old.join_point || new.join_point,
                        );
                    }
                    NodeChange::Structural => {
                        let impacted = stores.usages.get(&all_key(&new.id))?;
                        record_impact(
                            &mut result,
                            impacted,
                            old.join_point || new.join_point,
                        );
                    }
                }
            }

            // symbols that vanished from this source
            for (id, old) in old_by_id {
                let impacted = stores.usages.get(&all_key(&id))?;
                record_impact(&mut result, impacted, old.join_point);
            }
        }

        for source in delta.deleted() {
            for old in stores.nodes.get(source.as_str())?.unwrap_or_default() {
                let impacted = stores.usages.get(&all_key(&old.id))?;
                record_impact(&mut result, impacted, old.join_point);
            }
        }

        result.affected.retain(keep);
        result.forced_together.retain(keep);

        debug!(
            "differentiate: {} changed, {} deleted -> {} affected (incremental: {})",
            delta.changed().len(),
            delta.deleted().len(),
            result.affected.len(),
            result.is_incremental
        );
        Ok(result)
    }

    /// Merge a delta into the persisted graph, replacing stale node data for
    /// changed and deleted sources.
    ///
    /// Only called after a round with zero compile errors.
    pub fn integrate(&self, delta: &Delta) -> StorageResult<()> {
        let mut stores = self.lock();

        for (source, new_nodes) in delta.changed() {
            stores.unindex_source(source)?;
            stores.nodes.put(source.as_str(), new_nodes)?;
            for node in new_nodes {
                stores.index_node(source, node)?;
            }
        }

        for source in delta.deleted() {
            stores.unindex_source(source)?;
            stores.nodes.remove(source.as_str())?;
        }

        debug!(
            "integrated delta: {} changed, {} deleted",
            delta.changed().len(),
            delta.deleted().len()
        );
        Ok(())
    }

    /// Read-only query: sources with any recorded usage of a symbol.
    pub fn sources_using(&self, id: &NodeId) -> StorageResult<BTreeSet<NodeSource>> {
        let mut stores = self.lock();
        Ok(stores
            .usages
            .get(&all_key(id))?
            .into_iter()
            .map(NodeSource::from_key)
            .collect())
    }

    /// Read-only query: the persisted nodes of a source.
    pub fn nodes_of(&self, source: &NodeSource) -> StorageResult<Vec<Node>> {
        let mut stores = self.lock();
        Ok(stores.nodes.get(source.as_str())?.unwrap_or_default())
    }

    /// Flush all stores; normal shutdown.
    pub fn close(&self) -> StorageResult<()> {
        let mut stores = self.lock();
        stores.nodes.flush()?;
        stores.usages.flush()?;
        stores.defs.flush()?;
        Ok(())
    }

    /// Abnormal shutdown: skip the flush entirely. Entry writes already on
    /// disk stay; nothing further is committed.
    pub fn force_close(&self) {
        warn!("force-closing dependency graph without flush");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphStores> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn record_impact(result: &mut DifferentiateResult, impacted: BTreeSet<String>, join: bool) {
    for source in impacted {
        let source = NodeSource::from_key(source);
        if join {
            let _ = result.forced_together.insert(source.clone());
        }
        let _ = result.affected.insert(source);
    }
}

impl GraphStores {
    // Drop every index entry contributed by a source's current nodes.
    fn unindex_source(&mut self, source: &NodeSource) -> StorageResult<()> {
        for node in self.nodes.get(source.as_str())?.unwrap_or_default() {
            self.defs
                .remove_value(node.id.as_str(), &source.as_str().to_owned())?;
            for usage in &node.usages {
                let owner = source.as_str().to_owned();
                self.usages.remove_value(&all_key(&usage.symbol), &owner)?;
                match &usage.member {
                    Some(member) => {
                        self.usages
                            .remove_value(&member_key(&usage.symbol, member), &owner)?;
                    }
                    None => {
                        self.usages
                            .remove_value(&whole_key(&usage.symbol), &owner)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn index_node(&mut self, source: &NodeSource, node: &Node) -> StorageResult<()> {
        self.defs
            .append(node.id.as_str(), source.as_str().to_owned())?;
        for usage in &node.usages {
            let owner = source.as_str().to_owned();
            self.usages.append(&all_key(&usage.symbol), owner.clone())?;
            match &usage.member {
                Some(member) => {
                    self.usages
                        .append(&member_key(&usage.symbol, member), owner)?;
                }
                None => {
                    self.usages.append(&whole_key(&usage.symbol), owner)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Usage;
    use kiln_storage::ContentHash;
    use tempfile::TempDir;

    fn node(name: &str, members: &[(&str, &str)], usages: &[Usage]) -> Node {
        Node::new(
            NodeId::new(name),
            members
                .iter()
                .map(|(n, b)| ((*n).to_owned(), ContentHash::from_bytes(b.as_bytes())))
                .collect(),
            BTreeSet::new(),
            false,
            usages.iter().cloned().collect(),
        )
    }

    fn sealed_node(name: &str, members: &[(&str, &str)]) -> Node {
        Node::new(
            NodeId::new(name),
            members
                .iter()
                .map(|(n, b)| ((*n).to_owned(), ContentHash::from_bytes(b.as_bytes())))
                .collect(),
            BTreeSet::new(),
            true,
            BTreeSet::new(),
        )
    }

    fn integrate_initial(graph: &DependencyGraph) {
        // b.kt defines B; a.kt defines A and uses B.f()
        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/b.kt"),
            vec![node("B", &[("f()", "fun f(): Int")], &[])],
        );
        delta.associate(
            NodeSource::from_key("src/a.kt"),
            vec![node(
                "A",
                &[("main()", "fun main()")],
                &[Usage::of_member(NodeId::new("B"), "f()")],
            )],
        );
        graph.integrate(&delta).unwrap();
    }

    #[test]
    fn unchanged_signature_affects_nothing() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();
        integrate_initial(&graph);

        // body-only change: same surface
        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/b.kt"),
            vec![node("B", &[("f()", "fun f(): Int")], &[])],
        );

        let result = graph.differentiate(&delta).unwrap();
        assert!(result.is_incremental);
        assert!(result.affected.is_empty());
    }

    #[test]
    fn signature_change_affects_recorded_users() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();
        integrate_initial(&graph);

        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/b.kt"),
            vec![node("B", &[("f()", "fun f(): String")], &[])],
        );

        let result = graph.differentiate(&delta).unwrap();
        assert!(result.is_incremental);
        assert_eq!(
            result.affected.iter().map(NodeSource::as_str).collect::<Vec<_>>(),
            vec!["src/a.kt"]
        );
        assert!(result.forced_together.is_empty());
    }

    #[test]
    fn unchanged_member_does_not_affect_its_users() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();

        // c.kt uses only B.g(); a.kt uses B.f()
        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/b.kt"),
            vec![node(
                "B",
                &[("f()", "fun f(): Int"), ("g()", "fun g(): Int")],
                &[],
            )],
        );
        delta.associate(
            NodeSource::from_key("src/a.kt"),
            vec![node("A", &[], &[Usage::of_member(NodeId::new("B"), "f()")])],
        );
        delta.associate(
            NodeSource::from_key("src/c.kt"),
            vec![node("C", &[], &[Usage::of_member(NodeId::new("B"), "g()")])],
        );
        graph.integrate(&delta).unwrap();

        let mut change = graph.create_delta();
        change.associate(
            NodeSource::from_key("src/b.kt"),
            vec![node(
                "B",
                &[("f()", "fun f(): Long"), ("g()", "fun g(): Int")],
                &[],
            )],
        );
        let result = graph.differentiate(&change).unwrap();
        assert_eq!(
            result.affected.iter().map(NodeSource::as_str).collect::<Vec<_>>(),
            vec!["src/a.kt"]
        );
    }

    #[test]
    fn deleted_source_affects_users_of_its_symbols() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();
        integrate_initial(&graph);

        let mut delta = graph.create_delta();
        delta.mark_deleted(NodeSource::from_key("src/b.kt"));

        let result = graph.differentiate(&delta).unwrap();
        assert_eq!(
            result.affected.iter().map(NodeSource::as_str).collect::<Vec<_>>(),
            vec!["src/a.kt"]
        );
    }

    #[test]
    fn join_point_users_are_forced_together() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();

        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/shape.kt"),
            vec![sealed_node("Shape", &[("area()", "fun area(): Double")])],
        );
        delta.associate(
            NodeSource::from_key("src/render.kt"),
            vec![node("Render", &[], &[Usage::of(NodeId::new("Shape"))])],
        );
        graph.integrate(&delta).unwrap();

        let mut change = graph.create_delta();
        change.associate(
            NodeSource::from_key("src/shape.kt"),
            vec![sealed_node("Shape", &[("area()", "fun area(): Float")])],
        );
        let result = graph.differentiate(&change).unwrap();
        assert!(result.forced_together.contains(&NodeSource::from_key("src/render.kt")));
    }

    #[test]
    fn moved_symbol_requests_non_incremental_rebuild() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();
        integrate_initial(&graph);

        // B appears in a second live source while src/b.kt is untouched
        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/other.kt"),
            vec![node("B", &[("f()", "fun f(): Int")], &[])],
        );

        let result = graph.differentiate(&delta).unwrap();
        assert!(!result.is_incremental);
    }

    #[test]
    fn integration_replaces_stale_usage_entries() {
        let temp = TempDir::new().unwrap();
        let graph = DependencyGraph::open(temp.path()).unwrap();
        integrate_initial(&graph);

        // a.kt stops using B
        let mut delta = graph.create_delta();
        delta.associate(
            NodeSource::from_key("src/a.kt"),
            vec![node("A", &[("main()", "fun main()")], &[])],
        );
        graph.integrate(&delta).unwrap();

        assert!(graph.sources_using(&NodeId::new("B")).unwrap().is_empty());
    }
}
