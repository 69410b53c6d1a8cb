//! Per-target build statistics backing the rebuild heuristic.

use crate::atomic::atomic_write;
use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TargetStats {
    total_build_time_ms: u64,
    build_count: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDoc {
    last_successful_rebuild_ms: u64,
    targets: BTreeMap<String, TargetStats>,
}

/// Persistent build-time statistics: average per-target build durations and
/// the duration of the last successful full rebuild.
#[derive(Debug)]
pub struct TargetsStateStore {
    path: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    doc: StateDoc,
    modified: bool,
}

impl TargetsStateStore {
    /// Open the store, loading the backing file when it exists.
    pub fn open(path: PathBuf) -> StorageResult<Self> {
        let doc = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)
                .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?
        } else {
            StateDoc::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(State {
                doc,
                modified: false,
            }),
        })
    }

    /// Accumulate one build of a target into its running average.
    pub fn record_build(&self, target: &str, elapsed: Duration) {
        let mut state = self.lock();
        let stats = state.doc.targets.entry(target.to_owned()).or_default();
        stats.total_build_time_ms += elapsed.as_millis() as u64;
        stats.build_count += 1;
        state.modified = true;
    }

    /// Average recorded build time of a target; zero when never built.
    pub fn average_build_time_ms(&self, target: &str) -> u64 {
        let state = self.lock();
        match state.doc.targets.get(target) {
            Some(stats) if stats.build_count > 0 => stats.total_build_time_ms / stats.build_count,
            _ => 0,
        }
    }

    /// Duration of the last successful full rebuild; zero when unknown.
    pub fn last_successful_rebuild_ms(&self) -> u64 {
        self.lock().doc.last_successful_rebuild_ms
    }

    /// Record the duration of a full rebuild that finished cleanly.
    pub fn set_last_successful_rebuild(&self, elapsed: Duration) {
        let mut state = self.lock();
        state.doc.last_successful_rebuild_ms = elapsed.as_millis() as u64;
        state.modified = true;
    }

    /// Persist the store, skipping the write when nothing changed.
    pub fn save(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if !state.modified {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&state.doc)?;
        atomic_write(&self.path, json.as_bytes())?;
        state.modified = false;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
