use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{Storage, StorageError};

type Namespace = BTreeMap<String, Zeroizing<Vec<u8>>>;

/// In-memory storage implementation for testing and as a last-resort
/// fallback.
///
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access.
/// The lock is never held across an await point. Values are zeroed when
/// overwritten, deleted or dropped.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<String, Namespace>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a namespace.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock).
    #[allow(clippy::expect_used)]
    pub fn len(&self, namespace: &str) -> usize {
        self.inner.lock().expect("Mutex poisoned").get(namespace).map_or(0, BTreeMap::len)
    }

    /// True if no namespace holds any record.
    #[allow(clippy::expect_used)]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("Mutex poisoned").values().all(BTreeMap::is_empty)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(namespace).and_then(|ns| ns.get(key)).map(|value| value.to_vec()))
    }

    #[allow(clippy::expect_used)]
    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Zeroizing::new(value.to_vec()));
        Ok(())
    }

    #[allow(clippy::expect_used)]
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(ns) = inner.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(namespace).map(|ns| ns.keys().cloned().collect()).unwrap_or_default())
    }

    #[allow(clippy::expect_used)]
    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").remove(namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.put("ns", "k", b"v1").await.unwrap();
        storage.put("ns", "k", b"v2").await.unwrap();
        assert_eq!(storage.get("ns", "k").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(storage.len("ns"), 1);

        storage.delete("ns", "k").await.unwrap();
        assert_eq!(storage.get("ns", "k").await.unwrap(), None);

        // Deleting again is fine
        storage.delete("ns", "k").await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();

        a.put("ns", "k", b"shared").await.unwrap();
        assert_eq!(b.get("ns", "k").await.unwrap(), Some(b"shared".to_vec()));
    }

    #[tokio::test]
    async fn list_is_scoped_to_namespace() {
        let storage = MemoryStorage::new();
        storage.put("sessions", "alice", b"1").await.unwrap();
        storage.put("sessions", "bob", b"2").await.unwrap();
        storage.put("identity", "local", b"3").await.unwrap();

        let mut keys = storage.list("sessions").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["alice".to_string(), "bob".to_string()]);
        assert!(storage.list("unknown").await.unwrap().is_empty());
    }
}
