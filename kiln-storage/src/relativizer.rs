//! Project-root-relative path keys.
//!
//! Every persistent store addresses files through relativized keys with
//! forward-slash separators, so the stored data remains valid when the same
//! project is checked out under a different absolute path.

use std::path::{Path, PathBuf};

/// Converts between absolute filesystem paths and portable store keys.
#[derive(Debug, Clone)]
pub struct PathRelativizer {
    root: PathBuf,
}

impl PathRelativizer {
    /// Create a relativizer anchored at the project root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The anchoring project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Produce the store key for a path.
    ///
    /// Paths outside the project root keep their full (normalized) form so
    /// they still round-trip; they are just not portable across machines.
    pub fn relativize(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        normalize(relative)
    }

    /// Resolve a store key back to an absolute path.
    pub fn absolutize(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relativizes_paths_under_the_root() {
        let relativizer = PathRelativizer::new("/project");
        let key = relativizer.relativize(Path::new("/project/src/Main.kt"));
        assert_eq!(key, "src/Main.kt");
    }

    #[test]
    fn round_trips_through_absolutize() {
        let relativizer = PathRelativizer::new("/project");
        let original = Path::new("/project/src/a/B.java");
        let key = relativizer.relativize(original);
        assert_eq!(relativizer.absolutize(&key), original);
    }

    #[test]
    fn keeps_paths_outside_the_root_absolute() {
        let relativizer = PathRelativizer::new("/project");
        let jar = Path::new("/libs/guava.jar");
        let key = relativizer.relativize(jar);
        assert_eq!(relativizer.absolutize(&key), jar);
    }
}
