//! Key-value persistence capability.
//!
//! The registry only needs `get`/`set` of text blobs.  Reads are best-effort:
//! a missing or unreadable backing store behaves like an empty one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// In-memory store.  Clones share the same map, so a test can hand one clone
/// to a registry and inspect (or reopen) it through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.inner.lock().ok()?;
        map.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON-object file store.  The whole map is rewritten on every `set`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        Self { path, entries }
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable store {}: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
