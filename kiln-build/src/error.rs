//! Build error taxonomy.

use kiln_storage::StorageError;

/// Errors that stop or redirect a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A builder pass explicitly requested a build stop.
    #[error("builder \"{builder}\" requested build stop{}", format_message(.message))]
    StopBuild {
        /// Name of the pass that aborted.
        builder: String,
        /// Optional human-readable reason.
        message: Option<String>,
    },

    /// Persisted state is unusable; the caller must redo the build from a
    /// clean, non-incremental state.
    #[error("rebuild requested: {0}")]
    RebuildRequested(String),

    /// The cancellation token fired.
    #[error("build canceled")]
    Canceled,

    /// A persistent store failed; escalated to rebuild-requested by the
    /// top-level builder, never retried.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Non-store I/O failure (deleting outputs, scanning roots).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (e.g. a dependency cycle the chunker
    /// should have collapsed).
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_message(message: &Option<String>) -> String {
    match message {
        Some(text) => format!(": {text}"),
        None => String::new(),
    }
}

/// Result type used throughout the orchestrator.
pub type BuildResult<T> = Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_build_names_the_pass() {
        let err = BuildError::StopBuild {
            builder: "kotlin".to_owned(),
            message: Some("front-end error".to_owned()),
        };
        assert_eq!(
            err.to_string(),
            "builder \"kotlin\" requested build stop: front-end error"
        );

        let bare = BuildError::StopBuild {
            builder: "java".to_owned(),
            message: None,
        };
        assert_eq!(bare.to_string(), "builder \"java\" requested build stop");
    }
}
