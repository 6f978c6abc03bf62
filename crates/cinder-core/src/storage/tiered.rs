//! Primary/fallback storage pair.
//!
//! The primary (durable) store is authoritative. When it fails, writes land
//! in the fallback so ratchet state is never silently lost. A record only
//! sits in the fallback while it is newer than the primary's copy, so reads
//! prefer it and move it back into the primary once the primary accepts
//! writes again. An error only reaches the caller when both tiers fail.

use async_trait::async_trait;

use super::{Storage, StorageError};

/// Durable primary with a last-resort fallback.
#[derive(Clone)]
pub struct TieredStorage<P: Storage, F: Storage> {
    primary: P,
    fallback: F,
}

impl<P: Storage, F: Storage> TieredStorage<P, F> {
    /// Combine a primary and a fallback store.
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    /// Primary tier.
    pub fn primary(&self) -> &P {
        &self.primary
    }

    /// Fallback tier.
    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    /// Copy a fallback record into the primary and drop the fallback copy.
    /// Failures leave the record in the fallback, where reads still find it.
    async fn promote(&self, namespace: &str, key: &str, value: &[u8]) {
        if self.primary.put(namespace, key, value).await.is_err() {
            return;
        }
        match self.fallback.delete(namespace, key).await {
            Ok(()) => tracing::info!(namespace, "moved fallback record back to primary"),
            Err(e) => tracing::debug!(namespace, error = %e, "promoted record left in fallback"),
        }
    }
}

#[async_trait]
impl<P: Storage, F: Storage> Storage for TieredStorage<P, F> {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let fallback_err = match self.fallback.get(namespace, key).await {
            Ok(Some(value)) => {
                self.promote(namespace, key, &value).await;
                return Ok(Some(value));
            },
            Ok(None) => None,
            Err(e) => Some(e),
        };

        match self.primary.get(namespace, key).await {
            Ok(value) => Ok(value),
            Err(primary_err) => {
                tracing::warn!(
                    namespace,
                    error = %primary_err,
                    "primary storage read failed, using fallback"
                );
                match fallback_err {
                    Some(e) => Err(e),
                    None => Ok(None),
                }
            },
        }
    }

    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        match self.primary.put(namespace, key, value).await {
            // A copy left in the fallback would shadow the value just written
            Ok(()) => self.fallback.delete(namespace, key).await,
            Err(primary_err) => {
                tracing::warn!(
                    namespace,
                    error = %primary_err,
                    "primary storage write failed, writing to fallback"
                );
                self.fallback.put(namespace, key, value).await
            },
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let primary = self.primary.delete(namespace, key).await;
        let fallback = self.fallback.delete(namespace, key).await;
        primary.and(fallback)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let fallback = self.fallback.list(namespace).await;
        let mut keys = match self.primary.list(namespace).await {
            Ok(keys) => keys,
            Err(primary_err) => {
                tracing::warn!(
                    namespace,
                    error = %primary_err,
                    "primary storage list failed, using fallback"
                );
                return fallback;
            },
        };

        if let Ok(extra) = fallback {
            for key in extra {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        let primary = self.primary.clear(namespace).await;
        let fallback = self.fallback.clear(namespace).await;
        primary.and(fallback)
    }
}
