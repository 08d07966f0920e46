use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

/// Errors produced by raw store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RawStoreError {
    /// Underlying I/O failure (file system, remote backend, ...).
    #[error("storage i/o failure: {reason}")]
    Io { reason: String },
    /// Persisted contents could not be encoded or decoded.
    #[error("storage serialization failure: {reason}")]
    Serialization { reason: String },
    /// A writer panicked while holding the store lock.
    #[error("storage lock poisoned: {reason}")]
    LockPoisoned { reason: String },
}

/// Plain string-keyed persisted store that encrypted stores are layered on.
///
/// Every single-key operation is expected to be atomic. Nothing here retries;
/// a backend that wants retries owns that policy itself.
pub trait RawStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, RawStoreError>;

    /// Persist `value` under `key`, overwriting any existing entry.
    fn put(&self, key: &str, value: &str) -> Result<(), RawStoreError>;

    /// Remove `key` (idempotent).
    fn remove(&self, key: &str) -> Result<(), RawStoreError>;

    /// Whether an entry exists for `key`.
    fn contains(&self, key: &str) -> Result<bool, RawStoreError>;

    /// Drop every entry.
    fn clear(&self) -> Result<(), RawStoreError>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, RawStoreError>;

    fn is_empty(&self) -> Result<bool, RawStoreError> {
        Ok(self.len()? == 0)
    }

    /// Read `key`, falling back to `default` when absent.
    fn get_or(&self, key: &str, default: &str) -> Result<String, RawStoreError> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_string()))
    }
}

impl<S: RawStore + ?Sized> RawStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, RawStoreError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
        (**self).put(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), RawStoreError> {
        (**self).remove(key)
    }

    fn contains(&self, key: &str) -> Result<bool, RawStoreError> {
        (**self).contains(key)
    }

    fn clear(&self) -> Result<(), RawStoreError> {
        (**self).clear()
    }

    fn len(&self) -> Result<usize, RawStoreError> {
        (**self).len()
    }
}

/// In-memory raw store for tests and ephemeral sessions.
/// Clones share the same underlying map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored keys, in order.
    pub fn keys(&self) -> Result<Vec<String>, RawStoreError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map.keys().cloned().collect())
    }
}

impl RawStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, RawStoreError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), RawStoreError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RawStoreError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, RawStoreError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map.contains_key(key))
    }

    fn clear(&self) -> Result<(), RawStoreError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, RawStoreError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map.len())
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> RawStoreError {
    RawStoreError::LockPoisoned {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let store = MemoryStore::new();
        store.put("ui/theme", "payload").expect("put should succeed");

        assert_eq!(
            store.get("ui/theme").expect("get should succeed"),
            Some("payload".to_string())
        );
        assert!(store.contains("ui/theme").expect("contains"));
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MemoryStore::new();
        store.put("k", "v").expect("put should succeed");
        store.remove("k").expect("remove should succeed");
        store.remove("k").expect("remove again should still succeed");

        assert_eq!(store.get("k").expect("get"), None);
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let store = MemoryStore::new();
        assert_eq!(store.get_or("missing", "fallback").expect("get_or"), "fallback");

        store.put("present", "value").expect("put");
        assert_eq!(store.get_or("present", "fallback").expect("get_or"), "value");
    }

    #[test]
    fn clones_share_state_and_clear_empties() {
        let store = MemoryStore::new();
        let shared = store.clone();
        store.put("a", "1").expect("put");
        shared.put("b", "2").expect("put");

        assert_eq!(store.keys().expect("keys"), vec!["a".to_string(), "b".to_string()]);

        shared.clear().expect("clear");
        assert!(store.is_empty().expect("is_empty"));
    }
}
