//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All key material and session state survives restarts.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use redb::{Database, TableDefinition};

use super::{Storage, StorageError};

/// Table: records
/// Key: `namespace \0 key`
/// Value: CBOR-encoded record
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Separator between namespace and key. Never appears in either.
const SEPARATOR: char = '\0';

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
/// Transactions are short and synchronous; callers on a multi-threaded
/// runtime tolerate the brief blocking.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Storage for RedbStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        let record_key = encode_key(namespace, key)?;
        let value = table.get(record_key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(value.map(|v| v.value().to_vec()))
    }

    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let record_key = encode_key(namespace, key)?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            table
                .insert(record_key.as_str(), value)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let record_key = encode_key(namespace, key)?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            table.remove(record_key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let (start, end) = namespace_range(namespace)?;
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        let results = table
            .range(start.as_str()..end.as_str())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut keys = Vec::new();
        for result in results {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            if let Some((_, record_key)) = key.value().split_once(SEPARATOR) {
                keys.push(record_key.to_string());
            }
        }

        Ok(keys)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        let (start, end) = namespace_range(namespace)?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            table
                .retain_in(start.as_str()..end.as_str(), |_, _| false)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

/// Encode `(namespace, key)` as one table key.
fn encode_key(namespace: &str, key: &str) -> Result<String, StorageError> {
    if namespace.contains(SEPARATOR) || key.contains(SEPARATOR) {
        return Err(StorageError::Serialization("key contains NUL separator".to_string()));
    }
    Ok(format!("{namespace}{SEPARATOR}{key}"))
}

/// Half-open key range covering every record of a namespace.
///
/// `\u{1}` sorts directly after the `\0` separator.
fn namespace_range(namespace: &str) -> Result<(String, String), StorageError> {
    if namespace.contains(SEPARATOR) {
        return Err(StorageError::Serialization("namespace contains NUL separator".to_string()));
    }
    Ok((format!("{namespace}{SEPARATOR}"), format!("{namespace}\u{1}")))
}
