//! Source → output mapping.
//!
//! Records, per target, which relativized output paths each source file
//! produced. Supports idempotent append, single-output removal and the bulk
//! reverse lookup needed to find sources that share an output.

use crate::atomic::atomic_write;
use crate::relativizer::PathRelativizer;
use crate::{StorageError, StorageResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-target source→output map.
#[derive(Debug)]
pub struct SourceOutputMap {
    path: PathBuf,
    relativizer: Arc<PathRelativizer>,
    state: Mutex<MapState>,
}

#[derive(Debug, Default)]
struct MapState {
    // source key -> ordered output keys
    map: BTreeMap<String, Vec<String>>,
    modified: bool,
}

impl SourceOutputMap {
    /// Open a mapping store, loading the backing file when it exists.
    pub fn open(path: PathBuf, relativizer: Arc<PathRelativizer>) -> StorageResult<Self> {
        let map = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Vec<(String, Vec<String>)>>(&text)
                .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?
                .into_iter()
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            relativizer,
            state: Mutex::new(MapState {
                map,
                modified: false,
            }),
        })
    }

    /// Replace the recorded outputs of a source.
    pub fn set_outputs(&self, source: &Path, outputs: &[PathBuf]) {
        let source_key = self.relativizer.relativize(source);
        let output_keys: Vec<String> = outputs
            .iter()
            .map(|o| self.relativizer.relativize(o))
            .collect();
        let mut state = self.lock();
        if output_keys.is_empty() {
            let _ = state.map.remove(&source_key);
        } else {
            let _ = state.map.insert(source_key, output_keys);
        }
        state.modified = true;
    }

    /// Append one output to a source, keeping registration order. Idempotent.
    pub fn append_output(&self, source: &Path, output: &Path) {
        let source_key = self.relativizer.relativize(source);
        let output_key = self.relativizer.relativize(output);
        let mut state = self.lock();
        let outputs = state.map.entry(source_key).or_default();
        if !outputs.contains(&output_key) {
            outputs.push(output_key);
            state.modified = true;
        }
    }

    /// Drop a single output from a source's record.
    pub fn remove_output(&self, source: &Path, output: &Path) {
        let source_key = self.relativizer.relativize(source);
        let output_key = self.relativizer.relativize(output);
        let mut state = self.lock();
        if let Some(outputs) = state.map.get_mut(&source_key) {
            let before = outputs.len();
            outputs.retain(|o| o != &output_key);
            let changed = outputs.len() != before;
            let empty = outputs.is_empty();
            if changed {
                state.modified = true;
            }
            if empty {
                let _ = state.map.remove(&source_key);
            }
        }
    }

    /// Drop a source's record entirely.
    pub fn remove_source(&self, source: &Path) {
        let source_key = self.relativizer.relativize(source);
        let mut state = self.lock();
        if state.map.remove(&source_key).is_some() {
            state.modified = true;
        }
    }

    /// The recorded outputs of a source, as absolute paths in registration order.
    pub fn outputs(&self, source: &Path) -> Vec<PathBuf> {
        let source_key = self.relativizer.relativize(source);
        self.lock()
            .map
            .get(&source_key)
            .map(|outputs| {
                outputs
                    .iter()
                    .map(|o| self.relativizer.absolutize(o))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bulk reverse lookup: every source whose recorded outputs intersect
    /// the given output set. Used to find multiple sources sharing one
    /// output so they recompile together.
    pub fn sources_sharing_outputs(&self, outputs: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
        let output_keys: BTreeSet<String> = outputs
            .iter()
            .map(|o| self.relativizer.relativize(o))
            .collect();
        self.lock()
            .map
            .iter()
            .filter(|(_, outs)| outs.iter().any(|o| output_keys.contains(o)))
            .map(|(source, _)| self.relativizer.absolutize(source))
            .collect()
    }

    /// Cursor-style bulk iteration over all entries.
    pub fn entries(&self) -> Vec<(PathBuf, Vec<PathBuf>)> {
        self.lock()
            .map
            .iter()
            .map(|(source, outputs)| {
                (
                    self.relativizer.absolutize(source),
                    outputs
                        .iter()
                        .map(|o| self.relativizer.absolutize(o))
                        .collect(),
                )
            })
            .collect()
    }

    /// Persist the store, skipping the write when nothing changed.
    pub fn save(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if !state.modified {
            return Ok(());
        }
        let entries: Vec<(&String, &Vec<String>)> = state.map.iter().collect();
        let json = serde_json::to_string_pretty(&entries)?;
        atomic_write(&self.path, json.as_bytes())?;
        state.modified = false;
        debug!(
            "saved {} source mappings to {}",
            state.map.len(),
            self.path.display()
        );
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MapState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
