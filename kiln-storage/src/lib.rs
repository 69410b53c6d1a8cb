//! Persistent build-data stores for the kiln incremental build orchestrator.
//!
//! Everything in this crate survives process restarts: content stamps,
//! source→output mappings, library-root digests, generic graph node storage
//! and per-target build statistics. Stores are keyed by project-root-relative
//! paths so the on-disk data stays portable when a build root moves.
//!
//! All writes that replace a whole document go through the
//! write–fsync–rename pattern in [`atomic`], so a crashed build never leaves
//! a half-written store behind. A store that cannot be parsed reports
//! [`StorageError::Corrupted`]; callers are expected to escalate that to a
//! full rebuild rather than retry.

pub mod atomic;
pub mod digest;
pub mod kv;
pub mod library_roots;
pub mod relativizer;
pub mod source_map;
pub mod stamps;
pub mod targets_state;

pub use digest::ContentHash;
pub use kv::{CachedKvStore, FileKvStore, FileMultiMapStore, KeyValueStore};
pub use library_roots::{LibraryDiff, LibraryRootsStore};
pub use relativizer::PathRelativizer;
pub use source_map::SourceOutputMap;
pub use stamps::FileStampStore;
pub use targets_state::TargetsStateStore;

/// Errors raised by the persistent stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure while reading or writing a store file.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A store file exists but cannot be decoded.
    #[error("store data corrupted: {0}")]
    Corrupted(String),

    /// Serialization of in-memory store state failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;
