//! Generic persistent key→value and key→multivalue stores.
//!
//! The dependency graph persists its node data through these. The core
//! contract is a plain open/get/put/remove/flush interface; write-through
//! caching is a decorator on top, not part of the contract. The file-backed
//! implementation keeps one JSON document per entry in a hash-fanout
//! directory layout, so individual writes are small and atomic.

use crate::atomic::atomic_write;
use crate::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::debug;

/// Minimal persistent map contract.
pub trait KeyValueStore<V> {
    /// Read the value stored under a key.
    fn get(&mut self, key: &str) -> StorageResult<Option<V>>;

    /// Store a value under a key, replacing any previous value.
    fn put(&mut self, key: &str, value: &V) -> StorageResult<()>;

    /// Drop a key and its value.
    fn remove(&mut self, key: &str) -> StorageResult<()>;

    /// All keys currently stored.
    fn keys(&self) -> Vec<String>;

    /// Make pending state durable.
    fn flush(&mut self) -> StorageResult<()>;
}

#[derive(Serialize, Deserialize)]
struct Entry<V> {
    key: String,
    value: V,
}

/// File-set backed store: one JSON file per entry under `root`.
#[derive(Debug)]
pub struct FileKvStore<V> {
    root: PathBuf,
    // key -> entry file, rebuilt by scanning at open
    index: HashMap<String, PathBuf>,
    _marker: PhantomData<V>,
}

impl<V: Serialize + DeserializeOwned> FileKvStore<V> {
    /// Create or open a store rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut store = Self {
            root,
            index: HashMap::new(),
            _marker: PhantomData,
        };
        store.rebuild_index()?;
        Ok(store)
    }

    // Scan the fanout directories and recover the key of every entry file.
    fn rebuild_index(&mut self) -> StorageResult<()> {
        for subdir in std::fs::read_dir(&self.root)? {
            let subdir = subdir?.path();
            if !subdir.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(&subdir)? {
                let file = file?.path();
                // a crash between write and rename can leave a .tmp behind
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let text = std::fs::read_to_string(&file)?;
                let entry: Entry<V> = serde_json::from_str(&text)
                    .map_err(|e| StorageError::Corrupted(format!("{}: {e}", file.display())))?;
                let _ = self.index.insert(entry.key, file);
            }
        }
        debug!("opened kv store {} ({} entries)", self.root.display(), self.index.len());
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.root.join(&hash[..2]).join(format!("{hash}.json"))
    }
}

impl<V: Serialize + DeserializeOwned> KeyValueStore<V> for FileKvStore<V> {
    fn get(&mut self, key: &str) -> StorageResult<Option<V>> {
        let Some(path) = self.index.get(key) else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)?;
        let entry: Entry<V> = serde_json::from_str(&text)
            .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?;
        Ok(Some(entry.value))
    }

    fn put(&mut self, key: &str, value: &V) -> StorageResult<()> {
        let path = self.entry_path(key);
        let entry = Entry {
            key: key.to_owned(),
            value,
        };
        let json = serde_json::to_string(&entry)?;
        atomic_write(&path, json.as_bytes())?;
        let _ = self.index.insert(key.to_owned(), path);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StorageResult<()> {
        if let Some(path) = self.index.remove(key) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn flush(&mut self) -> StorageResult<()> {
        // entry writes are already durable
        Ok(())
    }
}

/// Write-through caching decorator over any [`KeyValueStore`].
///
/// Reads consult the in-memory cache first; writes go to both the cache and
/// the backing store. `None` results are cached too so repeated misses skip
/// the disk.
#[derive(Debug)]
pub struct CachedKvStore<S, V> {
    inner: S,
    cache: HashMap<String, Option<V>>,
}

impl<S: KeyValueStore<V>, V: Clone> CachedKvStore<S, V> {
    /// Wrap a backing store.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
        }
    }
}

impl<S: KeyValueStore<V>, V: Clone> KeyValueStore<V> for CachedKvStore<S, V> {
    fn get(&mut self, key: &str) -> StorageResult<Option<V>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }
        let value = self.inner.get(key)?;
        let _ = self.cache.insert(key.to_owned(), value.clone());
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &V) -> StorageResult<()> {
        self.inner.put(key, value)?;
        let _ = self.cache.insert(key.to_owned(), Some(value.clone()));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StorageResult<()> {
        self.inner.remove(key)?;
        let _ = self.cache.insert(key.to_owned(), None);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }
}

/// File-set backed key→multivalue store.
///
/// Values per key form an ordered set; appending an existing value is a
/// no-op, removing the last value drops the key.
#[derive(Debug)]
pub struct FileMultiMapStore<V> {
    inner: FileKvStore<BTreeSet<V>>,
}

impl<V> FileMultiMapStore<V>
where
    V: Serialize + DeserializeOwned + Ord + Clone,
{
    /// Create or open a multimap store rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        Ok(Self {
            inner: FileKvStore::open(root)?,
        })
    }

    /// The value set stored under a key.
    pub fn get(&mut self, key: &str) -> StorageResult<BTreeSet<V>> {
        Ok(self.inner.get(key)?.unwrap_or_default())
    }

    /// Add one value to a key's set.
    pub fn append(&mut self, key: &str, value: V) -> StorageResult<()> {
        let mut values = self.get(key)?;
        if values.insert(value) {
            self.inner.put(key, &values)?;
        }
        Ok(())
    }

    /// Remove one value from a key's set.
    pub fn remove_value(&mut self, key: &str, value: &V) -> StorageResult<()> {
        let mut values = self.get(key)?;
        if values.remove(value) {
            if values.is_empty() {
                self.inner.remove(key)?;
            } else {
                self.inner.put(key, &values)?;
            }
        }
        Ok(())
    }

    /// Drop a key and all its values.
    pub fn remove_all(&mut self, key: &str) -> StorageResult<()> {
        self.inner.remove(key)
    }

    /// All keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    /// Make pending state durable.
    pub fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }
}
