//! In-memory store shared by cloned handles.

use crate::traits::{apply_remove, apply_set, notify};
use crate::{KvStore, StorageChange, StorageError, StorageResult, CHANGE_CHANNEL_CAPACITY};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// In-memory key-value store.
///
/// Clones share the same map and change channel, so several engine instances
/// built from clones of one `MemoryKvStore` behave like separate contexts on
/// one platform store.
#[derive(Clone)]
pub struct MemoryKvStore {
    data: Arc<Mutex<HashMap<String, Value>>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            changes,
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.lock().map(|data| data.len()).unwrap_or(0)
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.data
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, keys: &[&str]) -> StorageResult<HashMap<String, Value>> {
        let data = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| data.get(*key).map(|v| ((*key).to_string(), v.clone())))
            .collect())
    }

    fn set(&self, entries: HashMap<String, Value>) -> StorageResult<()> {
        let changes = {
            let mut data = self.lock()?;
            apply_set(&mut data, entries)
        };
        notify(&self.changes, changes);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> StorageResult<()> {
        let changes = {
            let mut data = self.lock()?;
            apply_remove(&mut data, keys)
        };
        notify(&self.changes, changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    fn name(&self) -> &str {
        "memory"
    }
}
