//! Build targets, source roots and target chunks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Target identifier, stable for the duration of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target({})", self.0)
    }
}

/// Source root identifier within a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RootId(pub u32);

/// Closed set of target kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A module compilation unit (production or test sources).
    ModuleCompile,
}

/// One source root of a target.
#[derive(Debug, Clone)]
pub struct SourceRoot {
    /// Identifier, unique within the owning target.
    pub id: RootId,

    /// Root directory the sources live under.
    pub path: PathBuf,

    /// Generated roots hold builder-produced sources; their content is safe
    /// to regenerate and they are skipped by chained-target dirtying.
    pub generated: bool,
}

/// A compilation unit: identifier, source roots, output directory.
///
/// Immutable for the duration of a build.
#[derive(Debug)]
pub struct BuildTarget {
    id: TargetId,
    name: String,
    kind: TargetKind,
    source_roots: Vec<SourceRoot>,
    output_dir: PathBuf,
    tests: bool,
    depends_on: Vec<TargetId>,
}

impl BuildTarget {
    /// Assemble a target.
    pub fn new(
        id: TargetId,
        name: impl Into<String>,
        source_roots: Vec<SourceRoot>,
        output_dir: PathBuf,
        tests: bool,
        depends_on: Vec<TargetId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind: TargetKind::ModuleCompile,
            source_roots,
            output_dir,
            tests,
            depends_on,
        }
    }

    /// Target identifier.
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target kind.
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// The roots this target compiles from.
    pub fn source_roots(&self) -> &[SourceRoot] {
        &self.source_roots
    }

    /// Where compiled outputs land.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Whether this target holds test sources.
    pub fn is_tests(&self) -> bool {
        self.tests
    }

    /// Direct dependencies of this target.
    pub fn depends_on(&self) -> &[TargetId] {
        &self.depends_on
    }

    /// Find the source root containing a file.
    pub fn find_root(&self, file: &Path) -> Option<&SourceRoot> {
        self.source_roots.iter().find(|r| file.starts_with(&r.path))
    }
}

/// One or more mutually-cyclic targets scheduled and built as a unit.
#[derive(Debug, Clone)]
pub struct TargetChunk {
    /// Member target ids, in project declaration order.
    pub targets: Vec<TargetId>,
}

impl TargetChunk {
    /// Display name built from the member targets.
    pub fn presentable_name(&self, project: &Project) -> String {
        self.targets
            .iter()
            .filter_map(|id| project.target(*id))
            .map(|t| t.name().to_owned())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Whether the chunk contains a target.
    pub fn contains(&self, id: TargetId) -> bool {
        self.targets.contains(&id)
    }
}

/// The full set of targets participating in a build.
#[derive(Debug, Default)]
pub struct Project {
    targets: Vec<Arc<BuildTarget>>,
    by_id: HashMap<TargetId, usize>,
}

impl Project {
    /// Assemble a project from its targets.
    pub fn new(targets: Vec<BuildTarget>) -> Self {
        let targets: Vec<Arc<BuildTarget>> = targets.into_iter().map(Arc::new).collect();
        let by_id = targets
            .iter()
            .enumerate()
            .map(|(index, t)| (t.id(), index))
            .collect();
        Self { targets, by_id }
    }

    /// All targets in declaration order.
    pub fn targets(&self) -> &[Arc<BuildTarget>] {
        &self.targets
    }

    /// Look up a target by id.
    pub fn target(&self, id: TargetId) -> Option<&Arc<BuildTarget>> {
        self.by_id.get(&id).map(|index| &self.targets[*index])
    }

    /// Find the target (and root) owning a source file.
    pub fn find_owner(&self, file: &Path) -> Option<(&Arc<BuildTarget>, &SourceRoot)> {
        self.targets
            .iter()
            .find_map(|t| t.find_root(file).map(|root| (t, root)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: u32, root: &str, deps: Vec<TargetId>) -> BuildTarget {
        BuildTarget::new(
            TargetId(id),
            format!("mod{id}"),
            vec![SourceRoot {
                id: RootId(0),
                path: PathBuf::from(root),
                generated: false,
            }],
            PathBuf::from(format!("/out/mod{id}")),
            false,
            deps,
        )
    }

    #[test]
    fn find_owner_matches_the_containing_root() {
        let project = Project::new(vec![
            target(1, "/p/a/src", vec![]),
            target(2, "/p/b/src", vec![TargetId(1)]),
        ]);

        let (owner, root) = project.find_owner(Path::new("/p/b/src/Main.kt")).unwrap();
        assert_eq!(owner.id(), TargetId(2));
        assert_eq!(root.id, RootId(0));
        assert!(project.find_owner(Path::new("/elsewhere/X.kt")).is_none());
    }

    #[test]
    fn chunk_name_joins_member_targets() {
        let project = Project::new(vec![target(1, "/p/a", vec![]), target(2, "/p/b", vec![])]);
        let chunk = TargetChunk {
            targets: vec![TargetId(1), TargetId(2)],
        };
        assert_eq!(chunk.presentable_name(&project), "mod1+mod2");
    }
}
