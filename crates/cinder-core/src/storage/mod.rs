//! Storage abstraction for key material and ratchet state
//!
//! One namespaced key-value capability injected into every manager. The
//! cryptographic logic never knows which backend it talks to: an in-memory
//! map in tests, Redb in production, or a primary/fallback pair.
//!
//! Records are CBOR-encoded serde values. Buffers that held secret-bearing
//! records are zeroed after use.

mod chaotic;
mod error;
mod memory;
mod redb;
mod tiered;

use async_trait::async_trait;
pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Serialize, de::DeserializeOwned};
pub use tiered::TieredStorage;
use zeroize::Zeroizing;

pub use self::redb::RedbStorage;

/// Storage namespaces used by the managers.
pub mod namespace {
    /// Long-term identity key pair and registration id
    pub const IDENTITY: &str = "identity";
    /// Current and archived signed prekeys
    pub const SIGNED_PRE_KEYS: &str = "prekeys/signed";
    /// Unused one-time prekeys and the id allocator
    pub const ONE_TIME_PRE_KEYS: &str = "prekeys/one_time";
    /// Double Ratchet session state per peer
    pub const SESSIONS: &str = "sessions";
    /// Our own sender keys per group
    pub const OUTGOING_SENDER_KEYS: &str = "sender_keys/outgoing";
    /// Sender keys received from other members
    pub const INCOMING_SENDER_KEYS: &str = "sender_keys/incoming";
}

/// Namespaced key-value store.
///
/// Must be Clone (shared by several managers), Send + Sync (thread-safe).
/// Implementations typically share internal state via Arc, so clones access
/// the same underlying storage.
///
/// # Invariants
///
/// - `put` followed by `get` on the same `(namespace, key)` returns the value
///   written, until a `delete` or `clear`
/// - Namespaces are disjoint: operations never touch keys of another
///   namespace
#[async_trait]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Read a record. `None` if absent.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite a record.
    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a record. Removing an absent record is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// All keys in a namespace. Order is not guaranteed.
    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every record in a namespace.
    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        for key in self.list(namespace).await? {
            self.delete(namespace, &key).await?;
        }
        Ok(())
    }
}

/// Serialize `value` as CBOR and store it.
pub(crate) async fn put_record<S: Storage, T: Serialize>(
    storage: &S,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let mut bytes = Zeroizing::new(Vec::new());
    ciborium::into_writer(value, &mut *bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    storage.put(namespace, key, &bytes).await
}

/// Load and decode a CBOR record.
pub(crate) async fn get_record<S: Storage, T: DeserializeOwned>(
    storage: &S,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(bytes) = storage.get(namespace, key).await? else {
        return Ok(None);
    };
    let bytes = Zeroizing::new(bytes);

    let value = ciborium::from_reader(bytes.as_slice())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        #[serde(with = "serde_bytes")]
        blob: Vec<u8>,
    }

    #[tokio::test]
    async fn record_round_trip() {
        let storage = MemoryStorage::new();
        let record = Record { id: 9, blob: vec![1, 2, 3] };

        put_record(&storage, "test", "r", &record).await.unwrap();
        let loaded: Option<Record> = get_record(&storage, "test", "r").await.unwrap();

        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let storage = MemoryStorage::new();
        let loaded: Option<Record> = get_record(&storage, "test", "absent").await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn corrupt_record_is_serialization_error() {
        let storage = MemoryStorage::new();
        storage.put("test", "bad", &[0xff, 0x00]).await.unwrap();

        let result: Result<Option<Record>, _> = get_record(&storage, "test", "bad").await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }

    #[tokio::test]
    async fn clear_only_touches_one_namespace() {
        let storage = MemoryStorage::new();
        storage.put("a", "1", b"x").await.unwrap();
        storage.put("a", "2", b"y").await.unwrap();
        storage.put("b", "1", b"z").await.unwrap();

        storage.clear("a").await.unwrap();

        assert!(storage.list("a").await.unwrap().is_empty());
        assert_eq!(storage.get("b", "1").await.unwrap(), Some(b"z".to_vec()));
    }
}
