//! Build messages and the channel they travel through.

use std::path::PathBuf;
use std::sync::Mutex;

/// Severity of a compiler message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Informational note.
    Info,
    /// Non-fatal problem.
    Warning,
    /// Compile error; prevents dependency-graph integration for the round.
    Error,
}

/// A message attributed to a builder pass, optionally with a source position.
#[derive(Debug, Clone)]
pub struct CompilerMessage {
    pub builder: String,
    pub kind: MessageKind,
    pub text: String,
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CompilerMessage {
    pub fn new(builder: impl Into<String>, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            kind,
            text: text.into(),
            source: None,
            line: None,
            column: None,
        }
    }

    pub fn error(builder: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(builder, MessageKind::Error, text)
    }

    pub fn warning(builder: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(builder, MessageKind::Warning, text)
    }

    pub fn info(builder: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(builder, MessageKind::Info, text)
    }

    /// Attach the offending source path and position.
    pub fn at(mut self, source: PathBuf, line: u32, column: u32) -> Self {
        self.source = Some(source);
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Everything the orchestrator reports to the embedding tool.
#[derive(Debug, Clone)]
pub enum BuildMessage {
    /// A compiler diagnostic.
    Compiler(CompilerMessage),

    /// Free-form progress text.
    Progress(String),

    /// Output files were deleted (stale outputs, removed sources).
    FilesDeleted(Vec<String>),

    /// Per-pass timing summary emitted at the end of the build.
    BuilderStatistics {
        builder: String,
        processed_sources: usize,
        elapsed_ms: u64,
    },
}

/// Message channel to the embedding tool.
pub trait MessageSink: Send + Sync {
    /// Deliver one message.
    fn process(&self, message: BuildMessage);
}

/// Sink that retains every message; used by tests and embedders that render
/// diagnostics after the build.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<BuildMessage>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages seen so far.
    pub fn messages(&self) -> Vec<BuildMessage> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// All error-kind compiler messages.
    pub fn errors(&self) -> Vec<CompilerMessage> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                BuildMessage::Compiler(c) if c.kind == MessageKind::Error => Some(c),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for CollectingSink {
    fn process(&self, message: BuildMessage) {
        match self.messages.lock() {
            Ok(mut guard) => guard.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_retains_order() {
        let sink = CollectingSink::new();
        sink.process(BuildMessage::Progress("start".to_owned()));
        sink.process(BuildMessage::Compiler(CompilerMessage::error(
            "kotlin",
            "unresolved reference",
        )));

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.errors()[0].builder, "kotlin");
    }

    #[test]
    fn message_position_is_attached() {
        let msg = CompilerMessage::error("java", "';' expected")
            .at(PathBuf::from("/p/src/A.java"), 12, 40);
        assert_eq!(msg.line, Some(12));
        assert_eq!(msg.column, Some(40));
    }
}
