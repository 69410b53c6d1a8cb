//! Content digests used for change detection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::Path;

/// SHA-256 content digest, kept as a lowercase hex string.
///
/// A stamp store compares digests, never timestamps: equal digest means the
/// content is byte-identical to what was last observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Digest a file's current contents.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let content = std::fs::read(path)?;
        Ok(Self::from_bytes(&content))
    }

    /// Wrap an already-computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 8 chars
        write!(f, "{}", &self.0[..self.0.len().min(8)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_produces_identical_digest() {
        assert_eq!(
            ContentHash::from_bytes(b"class Foo {}"),
            ContentHash::from_bytes(b"class Foo {}"),
        );
    }

    #[test]
    fn different_content_produces_different_digest() {
        assert_ne!(
            ContentHash::from_bytes(b"class Foo {}"),
            ContentHash::from_bytes(b"class Bar {}"),
        );
    }

    #[test]
    fn display_is_shortened() {
        let hash = ContentHash::from_bytes(b"x");
        assert_eq!(format!("{hash}").len(), 8);
    }
}
