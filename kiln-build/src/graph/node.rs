//! Graph nodes: the symbol-level units the differentiation engine reasons
//! about.

use kiln_storage::{ContentHash, PathRelativizer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Normalized, hashable path key addressing graph nodes.
///
/// Decoupled from filesystem path encoding: always forward slashes, always
/// relative to the project root where possible. Both project sources and
/// library artifacts are addressed this way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeSource(String);

impl NodeSource {
    /// Key a filesystem path.
    pub fn from_path(relativizer: &PathRelativizer, path: &Path) -> Self {
        Self(relativizer.relativize(path))
    }

    /// Wrap an already-normalized key.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The normalized key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve back to an absolute filesystem path.
    pub fn to_path(&self, relativizer: &PathRelativizer) -> std::path::PathBuf {
        relativizer.absolutize(&self.0)
    }
}

impl fmt::Display for NodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully-qualified symbol name, e.g. `com.example.Shape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded use of another symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Usage {
    /// The symbol being used.
    pub symbol: NodeId,

    /// `Some(member)` for a member access, `None` for whole-symbol usages
    /// (inheritance, instanceof, imports).
    pub member: Option<String>,
}

impl Usage {
    /// Whole-symbol usage.
    pub fn of(symbol: NodeId) -> Self {
        Self {
            symbol,
            member: None,
        }
    }

    /// Member access usage.
    pub fn of_member(symbol: NodeId, member: impl Into<String>) -> Self {
        Self {
            symbol,
            member: Some(member.into()),
        }
    }
}

/// A symbol extracted from a compiled artifact: its public surface plus the
/// usages it makes of other symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Symbol name.
    pub id: NodeId,

    /// Digest over the whole public surface (members + inheritance).
    pub signature: ContentHash,

    /// Per-member surface digests, keyed by member name.
    pub members: BTreeMap<String, ContentHash>,

    /// Direct supertypes.
    pub supers: BTreeSet<NodeId>,

    /// Join-point symbols (sealed class members, union alternatives) force
    /// their users to recompile together even within the same round.
    pub join_point: bool,

    /// Usages this symbol makes of other symbols.
    pub usages: BTreeSet<Usage>,
}

impl Node {
    /// Assemble a node, deriving the surface signature from the members,
    /// supertypes and join-point status.
    pub fn new(
        id: NodeId,
        members: BTreeMap<String, ContentHash>,
        supers: BTreeSet<NodeId>,
        join_point: bool,
        usages: BTreeSet<Usage>,
    ) -> Self {
        let signature = surface_signature(&members, &supers, join_point);
        Self {
            id,
            signature,
            members,
            supers,
            join_point,
            usages,
        }
    }
}

fn surface_signature(
    members: &BTreeMap<String, ContentHash>,
    supers: &BTreeSet<NodeId>,
    join_point: bool,
) -> ContentHash {
    let mut surface = Vec::new();
    for (name, digest) in members {
        surface.extend_from_slice(name.as_bytes());
        surface.push(b'=');
        surface.extend_from_slice(digest.as_str().as_bytes());
        surface.push(b'|');
    }
    for sup in supers {
        surface.extend_from_slice(b"extends ");
        surface.extend_from_slice(sup.as_str().as_bytes());
        surface.push(b'|');
    }
    if join_point {
        surface.extend_from_slice(b"sealed|");
    }
    ContentHash::from_bytes(&surface)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(entries: &[(&str, &str)]) -> BTreeMap<String, ContentHash> {
        entries
            .iter()
            .map(|(name, body)| ((*name).to_owned(), ContentHash::from_bytes(body.as_bytes())))
            .collect()
    }

    #[test]
    fn identical_surfaces_produce_identical_signatures() {
        let a = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[("bar()", "fun bar(): Int")]),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        );
        let b = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[("bar()", "fun bar(): Int")]),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        );
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn member_signature_change_changes_the_surface() {
        let before = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[("bar()", "fun bar(): Int")]),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        );
        let after = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[("bar()", "fun bar(): String")]),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        );
        assert_ne!(before.signature, after.signature);
    }

    #[test]
    fn inheritance_change_changes_the_surface() {
        let base: BTreeSet<NodeId> = [NodeId::new("com.example.Base")].into_iter().collect();
        let before = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[]),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        );
        let after = Node::new(
            NodeId::new("com.example.Foo"),
            members(&[]),
            base,
            false,
            BTreeSet::new(),
        );
        assert_ne!(before.signature, after.signature);
    }
}
