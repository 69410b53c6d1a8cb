//! Symbol-surface comparison: what kind of change happened to a node.

use super::node::{Node, NodeSource};
use std::collections::BTreeSet;

/// Outcome of differentiating a delta against the persisted graph.
#[derive(Debug, Default)]
pub struct DifferentiateResult {
    /// `false` means the change is too structural to reason about
    /// file-by-file; the caller must force a full, non-incremental rebuild.
    pub is_incremental: bool,

    /// Sources whose compiled output referenced a changed symbol.
    pub affected: BTreeSet<NodeSource>,

    /// Subset of `affected` reached through join-point symbols (sealed or
    /// union-type members); these recompile together even when already
    /// compiled in the current round.
    pub forced_together: BTreeSet<NodeSource>,
}

impl DifferentiateResult {
    /// An incremental result with nothing affected.
    pub fn incremental() -> Self {
        Self {
            is_incremental: true,
            ..Self::default()
        }
    }
}

/// How a symbol's public surface changed between two builds.
#[derive(Debug, PartialEq, Eq)]
pub enum NodeChange {
    /// Surfaces are identical; body-only edits land here.
    Unchanged,

    /// Only the named members changed (added, removed or re-typed); users
    /// of other members are unaffected.
    Members(BTreeSet<String>),

    /// Inheritance or join-point status changed; every user of the symbol
    /// is affected.
    Structural,
}

/// Compare two versions of the same symbol.
pub fn classify_change(old: &Node, new: &Node) -> NodeChange {
    if old.signature == new.signature {
        return NodeChange::Unchanged;
    }
    if old.supers != new.supers || old.join_point != new.join_point {
        return NodeChange::Structural;
    }

    let mut changed = BTreeSet::new();
    for (name, digest) in &old.members {
        if new.members.get(name) != Some(digest) {
            let _ = changed.insert(name.clone());
        }
    }
    for name in new.members.keys() {
        if !old.members.contains_key(name) {
            let _ = changed.insert(name.clone());
        }
    }

    if changed.is_empty() {
        // signature differs but we cannot attribute it to a member
        NodeChange::Structural
    } else {
        NodeChange::Members(changed)
    }
}
