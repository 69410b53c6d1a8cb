//! Output registration sink with cross-pass collision detection.

use crate::messages::{BuildMessage, CompilerMessage, MessageKind, MessageSink};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One registered output with the sources that produced it.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub target: crate::target::TargetId,
    pub builder: String,
    pub output: PathBuf,
    pub sources: Vec<PathBuf>,
}

/// Where builder passes register the artifacts they produce.
pub trait OutputSink: Send + Sync {
    /// Record that `output` was produced from `sources` for `target`.
    fn register_output(
        &self,
        target: crate::target::TargetId,
        output: &Path,
        sources: &[PathBuf],
    );

    /// Record that a previously produced output is gone.
    fn remove_output(&self, output: &Path);
}

#[derive(Debug, Default)]
struct SinkState {
    current_builder: Option<String>,
    // output path -> name of the pass that registered it
    output_to_builder: HashMap<PathBuf, String>,
    records: Vec<OutputRecord>,
    removed: BTreeSet<PathBuf>,
    processed_by_builder: HashMap<String, usize>,
}

/// Per-chunk output sink.
///
/// Two different passes registering the same output path is an error, not a
/// silent overwrite: a collision message naming both passes goes to the
/// message channel and flips the chunk's error flag.
pub struct ChunkOutputSink {
    messages: Arc<dyn MessageSink>,
    chunk_errors: Arc<AtomicBool>,
    build_errors: Arc<AtomicBool>,
    state: Mutex<SinkState>,
}

impl ChunkOutputSink {
    pub fn new(
        messages: Arc<dyn MessageSink>,
        chunk_errors: Arc<AtomicBool>,
        build_errors: Arc<AtomicBool>,
    ) -> Self {
        Self {
            messages,
            chunk_errors,
            build_errors,
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Attribute subsequent registrations to a pass.
    pub fn set_current_builder(&self, builder: Option<&str>) {
        self.lock().current_builder = builder.map(str::to_owned);
    }

    /// Claim the outputs registered since the last take. Called at round
    /// completion to commit mapping updates and feed the graph delta.
    pub fn take_round_records(&self) -> Vec<OutputRecord> {
        std::mem::take(&mut self.lock().records)
    }

    /// Outputs removed during the round.
    pub fn take_removed(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.lock().removed).into_iter().collect()
    }

    /// Sources processed by one pass so far (for build statistics).
    pub fn processed_sources(&self, builder: &str) -> usize {
        self.lock()
            .processed_by_builder
            .get(builder)
            .copied()
            .unwrap_or(0)
    }

    /// Drop all round-local state; used when a chunk rebuild restarts the
    /// loop from round one.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.removed.clear();
        state.output_to_builder.clear();
        state.processed_by_builder.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OutputSink for ChunkOutputSink {
    fn register_output(
        &self,
        target: crate::target::TargetId,
        output: &Path,
        sources: &[PathBuf],
    ) {
        let mut state = self.lock();
        let builder = state
            .current_builder
            .clone()
            .unwrap_or_else(|| "<unknown>".to_owned());

        if let Some(previous) = state
            .output_to_builder
            .insert(output.to_path_buf(), builder.clone())
            && previous != builder
        {
            let mut message = CompilerMessage::new(
                builder.clone(),
                MessageKind::Error,
                format!(
                    "output file \"{}\" has already been registered by \"{previous}\"",
                    output.display()
                ),
            );
            message.source = sources.first().cloned();
            self.chunk_errors.store(true, Ordering::SeqCst);
            self.build_errors.store(true, Ordering::SeqCst);
            self.messages.process(BuildMessage::Compiler(message));
        }

        *state.processed_by_builder.entry(builder.clone()).or_default() += sources.len();
        state.records.push(OutputRecord {
            target,
            builder,
            output: output.to_path_buf(),
            sources: sources.to_vec(),
        });
    }

    fn remove_output(&self, output: &Path) {
        let _ = self.lock().removed.insert(output.to_path_buf());
    }
}
