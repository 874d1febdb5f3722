//! JSON-file backed store.

use crate::traits::{apply_remove, apply_set, diff_maps, notify};
use crate::{KvStore, StorageChange, StorageError, StorageResult, CHANGE_CHANNEL_CAPACITY};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// File permissions for the store file (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

type Map = HashMap<String, Value>;

/// Key-value store persisted as a single JSON object.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so readers never observe a half-written map. Writes through any
/// clone of this handle are reported to subscribers right away. Writes by
/// other processes are reported once this handle re-reads the file, either
/// on its next write or from [`FileKvStore::watch`].
#[derive(Clone)]
pub struct FileKvStore {
    path: PathBuf,
    /// Map as last read or written by this handle. The mutex also
    /// serializes file access between clones.
    seen: Arc<Mutex<Option<Map>>>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileKvStore {
    /// Open (or lazily create) a store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            seen: Arc::new(Mutex::new(None)),
            changes,
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and notify subscribers of every key that differs
    /// from what this handle saw last. The first call only records a
    /// baseline. Returns the number of changes reported.
    pub fn reload(&self) -> StorageResult<usize> {
        let changes = blocking(|| -> StorageResult<Vec<StorageChange>> {
            let mut seen = self.lock()?;
            let data = self.read_map()?;
            let changes = external_changes(&seen, &data);
            *seen = Some(data);
            Ok(changes)
        })?;

        let count = changes.len();
        notify(&self.changes, changes);
        Ok(count)
    }

    /// Reload every `period` until the returned handle is aborted.
    ///
    /// The baseline is taken before this returns, so any write that lands
    /// afterwards is reported.
    pub fn watch(&self, period: Duration) -> JoinHandle<()> {
        if let Err(e) = self.reload() {
            warn!(path = %self.path.display(), error = %e, "Could not read store file");
        }

        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.reload() {
                    Ok(0) => {}
                    Ok(changed) => debug!(changed, "Store file changed on disk"),
                    Err(e) => {
                        warn!(path = %store.path.display(), error = %e, "Could not re-read store file")
                    }
                }
            }
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Option<Map>>> {
        self.seen
            .lock()
            .map_err(|_| StorageError::Backend("file store lock poisoned".to_string()))
    }

    fn read_map(&self) -> StorageResult<Map> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map(&self, data: &Map) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(data)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(FILE_MODE))?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), keys = data.len(), "Store file written");
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Map) -> Vec<StorageChange>,
    {
        let changes = blocking(|| -> StorageResult<Vec<StorageChange>> {
            let mut seen = self.lock()?;
            let mut data = self.read_map()?;
            let mut changes = external_changes(&seen, &data);
            let own = f(&mut data);
            if !own.is_empty() {
                self.write_map(&data)?;
            }
            changes.extend(own);
            *seen = Some(data);
            Ok(changes)
        })?;
        notify(&self.changes, changes);
        Ok(())
    }
}

/// Changes made behind this handle's back since it last looked.
fn external_changes(seen: &Option<Map>, current: &Map) -> Vec<StorageChange> {
    seen.as_ref()
        .map(|previous| diff_maps(previous, current))
        .unwrap_or_default()
}

/// Run file I/O without stalling the other tasks of a multi-threaded
/// runtime. On a current-thread runtime, or outside tokio, `f` runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl KvStore for FileKvStore {
    fn get(&self, keys: &[&str]) -> StorageResult<HashMap<String, Value>> {
        let mut data = blocking(|| -> StorageResult<Map> {
            let _seen = self.lock()?;
            self.read_map()
        })?;
        Ok(keys
            .iter()
            .filter_map(|key| data.remove(*key).map(|v| ((*key).to_string(), v)))
            .collect())
    }

    fn set(&self, entries: HashMap<String, Value>) -> StorageResult<()> {
        self.mutate(|data| apply_set(data, entries))
    }

    fn remove(&self, keys: &[&str]) -> StorageResult<()> {
        self.mutate(|data| apply_remove(data, keys))
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("store.json"));
        assert!(store.get(&["anything"]).unwrap().is_empty());
    }

    #[test]
    fn test_set_get_remove_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("nested").join("store.json"));

        store.set_one("a", json!({"x": 1})).unwrap();
        store.set_one("b", json!("two")).unwrap();
        assert_eq!(store.get_one("a").unwrap(), Some(json!({"x": 1})));

        // A fresh handle on the same file sees the persisted data
        let reopened = FileKvStore::new(store.path().to_path_buf());
        assert_eq!(reopened.get_one("b").unwrap(), Some(json!("two")));

        store.remove(&["a"]).unwrap();
        assert_eq!(reopened.get_one("a").unwrap(), None);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupted_file_is_encoding_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{broken").unwrap();

        let store = FileKvStore::new(path);
        assert!(matches!(store.get(&["a"]), Err(StorageError::Encoding(_))));
    }

    #[test]
    fn test_notifications_for_clone_writes() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("store.json"));
        let mut rx = store.clone().subscribe();

        store.set_one("k", json!(true)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.new_value, Some(json!(true)));
    }

    #[test]
    fn test_reload_reports_writes_from_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let writer = FileKvStore::new(&path);
        let reader = FileKvStore::new(&path);
        let mut rx = reader.subscribe();

        writer.set_one("before", json!(1)).unwrap();
        assert_eq!(reader.reload().unwrap(), 0, "first reload is the baseline");
        assert!(rx.try_recv().is_err());

        writer.set_one("k", json!("v")).unwrap();
        writer.remove(&["before"]).unwrap();
        assert_eq!(reader.reload().unwrap(), 2);

        let removed = rx.try_recv().unwrap();
        assert_eq!(removed.key, "before");
        assert_eq!(removed.new_value, None);
        let added = rx.try_recv().unwrap();
        assert_eq!(added.key, "k");
        assert_eq!(added.new_value, Some(json!("v")));

        assert_eq!(reader.reload().unwrap(), 0);
    }

    #[test]
    fn test_own_write_also_reports_pending_external_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let writer = FileKvStore::new(&path);
        let reader = FileKvStore::new(&path);
        reader.reload().unwrap();
        let mut rx = reader.subscribe();

        writer.set_one("theirs", json!(1)).unwrap();
        reader.set_one("mine", json!(2)).unwrap();

        assert_eq!(rx.try_recv().unwrap().key, "theirs");
        assert_eq!(rx.try_recv().unwrap().key, "mine");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_delivers_writes_from_another_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let other_process = FileKvStore::new(&path);
        let store = FileKvStore::new(&path);
        let mut rx = store.subscribe();
        let watcher = store.watch(Duration::from_secs(1));

        other_process.set_one("auth_state", json!({"authenticated": false})).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the write")
            .unwrap();
        assert_eq!(change.key, "auth_state");
        assert_eq!(change.old_value, None);
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_does_not_repeat_own_writes() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("store.json"));
        let mut rx = store.subscribe();
        let watcher = store.watch(Duration::from_secs(1));

        store.set_one("k", json!(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap().key, "k");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        watcher.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_usable_from_multi_thread_runtime() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("store.json"));

        store.set_one("k", json!(1)).unwrap();
        assert_eq!(store.get_one("k").unwrap(), Some(json!(1)));
        assert_eq!(store.reload().unwrap(), 0);
    }
}
