//! Incremental build orchestrator for JVM module graphs.
//!
//! Embedded inside a larger build tool, this crate decides, for every build
//! invocation, exactly which source files need recompiling and which
//! already-compiled outputs remain valid. The compiler front ends themselves
//! are collaborators behind the [`builder::BuilderPass`] and
//! [`extract::SymbolExtractor`] traits.
//!
//! The moving parts:
//! - [`scheduler`] computes a dependency DAG of target chunks and runs
//!   independent subgraphs concurrently;
//! - [`rounds`] drives builder passes over each chunk until a fixed point;
//! - [`fs_state`] tracks dirty and removed files across those rounds;
//! - [`graph`] differentiates class-level symbol changes into additional
//!   dirty files, in this target or its dependents;
//! - `kiln-storage` persists stamps, mappings, library digests and graph
//!   nodes so the next invocation can skip unchanged work entirely.

pub mod build;
pub mod builder;
pub mod context;
pub mod error;
pub mod extract;
pub mod fs_state;
pub mod graph;
pub mod libraries;
pub mod messages;
pub mod output_sink;
pub mod rounds;
pub mod scheduler;
pub mod stores;
pub mod target;

pub use build::{BuildOptions, BuildOutcome, IncrementalBuilder};
pub use builder::{BuilderPass, PassExit};
pub use context::{BuildContext, CancelToken, ChunkContext, CompileScope};
pub use error::{BuildError, BuildResult};
pub use extract::SymbolExtractor;
pub use fs_state::{CompilationRound, DirtyFilesView, FsState};
pub use graph::{Delta, DependencyGraph, DifferentiateResult, Node, NodeId, NodeSource, Usage};
pub use libraries::{DependencyDescriptor, LibraryState};
pub use messages::{BuildMessage, CollectingSink, CompilerMessage, MessageKind, MessageSink};
pub use output_sink::{ChunkOutputSink, OutputRecord, OutputSink};
pub use scheduler::{ChunkGraph, ChunkScheduler};
pub use stores::BuildStores;
pub use target::{BuildTarget, Project, RootId, SourceRoot, TargetChunk, TargetId, TargetKind};
