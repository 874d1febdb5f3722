//! Storage trait definitions.

use crate::StorageResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A single key change observed on a shared store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    /// Key that changed.
    pub key: String,
    /// Value before the write, `None` if the key was absent.
    pub old_value: Option<Value>,
    /// Value after the write, `None` if the key was removed.
    pub new_value: Option<Value>,
}

/// Trait for key-value stores shared across process contexts.
///
/// Each operation is atomic with respect to other operations on the same
/// store. `set` replaces every given key in full; there are no partial
/// updates of a stored value.
pub trait KvStore: Send + Sync {
    /// Read several keys at once. Absent keys are omitted from the result.
    fn get(&self, keys: &[&str]) -> StorageResult<HashMap<String, Value>>;

    /// Write several keys at once, replacing any previous values.
    fn set(&self, entries: HashMap<String, Value>) -> StorageResult<()>;

    /// Remove several keys at once. Removing an absent key is not an error.
    fn remove(&self, keys: &[&str]) -> StorageResult<()>;

    /// Subscribe to changes. Only keys whose value actually changed are reported.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Name of this storage backend.
    fn name(&self) -> &str;

    /// Read a single key.
    fn get_one(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.get(&[key])?.remove(key))
    }

    /// Write a single key.
    fn set_one(&self, key: &str, value: Value) -> StorageResult<()> {
        self.set(HashMap::from([(key.to_string(), value)]))
    }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, keys: &[&str]) -> StorageResult<HashMap<String, Value>> {
        (**self).get(keys)
    }
    fn set(&self, entries: HashMap<String, Value>) -> StorageResult<()> {
        (**self).set(entries)
    }
    fn remove(&self, keys: &[&str]) -> StorageResult<()> {
        (**self).remove(keys)
    }
    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        (**self).subscribe()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Apply `entries` to `data`, returning the changes that actually happened.
pub(crate) fn apply_set(
    data: &mut HashMap<String, Value>,
    entries: HashMap<String, Value>,
) -> Vec<StorageChange> {
    let mut changes = Vec::new();
    for (key, value) in entries {
        let old_value = data.insert(key.clone(), value.clone());
        if old_value.as_ref() != Some(&value) {
            changes.push(StorageChange {
                key,
                old_value,
                new_value: Some(value),
            });
        }
    }
    changes
}

/// Remove `keys` from `data`, returning the changes that actually happened.
pub(crate) fn apply_remove(data: &mut HashMap<String, Value>, keys: &[&str]) -> Vec<StorageChange> {
    keys.iter()
        .filter_map(|key| {
            data.remove(*key).map(|old| StorageChange {
                key: (*key).to_string(),
                old_value: Some(old),
                new_value: None,
            })
        })
        .collect()
}

/// Changes that turn `old` into `new`, in key order.
pub(crate) fn diff_maps(
    old: &HashMap<String, Value>,
    new: &HashMap<String, Value>,
) -> Vec<StorageChange> {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let (old_value, new_value) = (old.get(key), new.get(key));
            (old_value != new_value).then(|| StorageChange {
                key: key.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            })
        })
        .collect()
}

/// Deliver changes to subscribers. Having no subscribers is fine.
pub(crate) fn notify(sender: &broadcast::Sender<StorageChange>, changes: Vec<StorageChange>) {
    for change in changes {
        tracing::trace!(key = %change.key, removed = change.new_value.is_none(), "Storage change");
        let _ = sender.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_maps_reports_added_changed_and_removed() {
        let old = HashMap::from([
            ("same".to_string(), json!(1)),
            ("changed".to_string(), json!("a")),
            ("removed".to_string(), json!(true)),
        ]);
        let new = HashMap::from([
            ("same".to_string(), json!(1)),
            ("changed".to_string(), json!("b")),
            ("added".to_string(), json!(null)),
        ]);

        let changes = diff_maps(&old, &new);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["added", "changed", "removed"]);
        assert_eq!(changes[0].old_value, None);
        assert_eq!(changes[1].new_value, Some(json!("b")));
        assert_eq!(changes[2].new_value, None);
        assert!(diff_maps(&new, &new).is_empty());
    }
}
