//! Signed and one-time prekey management.
//!
//! The current signed prekey rotates on a 7-day cadence. A superseded key
//! moves to an archive where it stays retrievable by id for 30 days, so
//! sessions initiated against it just before rotation can still be accepted.
//! The archive is pruned by age every time a key is archived.

use std::sync::Arc;

use cinder_crypto::{IdentityKey, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    E2eeError,
    codec::MAX_KEY_ID,
    config::PreKeyConfig,
    env::Environment,
    identity::IdentityManager,
    storage::{Storage, get_record, namespace, put_record},
    x3dh::PreKeyBundle,
};

const CURRENT_KEY: &str = "current";
const ARCHIVE_KEY: &str = "archive";
const NEXT_ONE_TIME_ID_KEY: &str = "next_id";

/// Medium-term key pair signed by the identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    key_id: u32,
    key_pair: KeyPair,
    signature: Signature,
    timestamp: u64,
}

impl SignedPreKey {
    /// 24-bit key id.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Public half.
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    /// Full key pair.
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Identity signature over the encoded public key.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Creation time (Unix ms).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Check the signature against `identity`.
    pub fn verify(&self, identity: &IdentityKey) -> Result<(), E2eeError> {
        verify_signed_pre_key(identity, self.public_key(), &self.signature)
    }
}

/// Verify that `signature` is `identity`'s signature over the encoded
/// `public_key`.
pub fn verify_signed_pre_key(
    identity: &IdentityKey,
    public_key: &PublicKey,
    signature: &Signature,
) -> Result<(), E2eeError> {
    identity.verify(&public_key.encode(), signature).map_err(|err| {
        tracing::debug!(error = %err, "signed prekey signature rejected");
        E2eeError::InvalidSignature
    })
}

/// Single-use prekey consumed by the first session that references it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    key_id: u32,
    key_pair: KeyPair,
}

impl OneTimePreKey {
    /// 24-bit key id.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Public half.
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    /// Full key pair.
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

#[derive(Serialize, Deserialize)]
struct ArchivedSignedPreKey {
    key: SignedPreKey,
    archived_at: u64,
}

/// Generates, rotates, archives and serves prekeys.
pub struct PreKeyManager<S: Storage, E: Environment> {
    storage: S,
    env: E,
    identity: Arc<dyn IdentityManager>,
    config: PreKeyConfig,
    /// Serializes generation so lazy creation and rotation never race
    write_lock: Mutex<()>,
}

impl<S: Storage, E: Environment> PreKeyManager<S, E> {
    /// Create a manager over `storage`.
    pub fn new(
        storage: S,
        env: E,
        identity: Arc<dyn IdentityManager>,
        config: PreKeyConfig,
    ) -> Self {
        Self { storage, env, identity, config, write_lock: Mutex::new(()) }
    }

    /// Generate a new signed prekey, archive the current one and install the
    /// new key as current.
    pub async fn generate_signed_pre_key(&self) -> Result<SignedPreKey, E2eeError> {
        let _guard = self.write_lock.lock().await;
        self.generate_locked().await
    }

    /// Current signed prekey, generated on first use.
    pub async fn current_signed_pre_key(&self) -> Result<SignedPreKey, E2eeError> {
        if let Some(current) = self.load_current().await? {
            return Ok(current);
        }

        let _guard = self.write_lock.lock().await;
        // Another caller may have generated while we waited
        match self.load_current().await? {
            Some(current) => Ok(current),
            None => self.generate_locked().await,
        }
    }

    /// Look up a signed prekey by id: current first, then the archive.
    ///
    /// Archived keys older than the retention window are treated as gone.
    pub async fn signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKey>, E2eeError> {
        let current = self.load_current().await?;
        if let Some(current) = current.filter(|current| current.key_id == key_id) {
            return Ok(Some(current));
        }

        let now = self.env.now_millis();
        let retention = self.config.archive_retention().as_millis() as u64;
        let archive = self.load_archive().await?;

        Ok(archive
            .into_iter()
            .find(|entry| entry.key.key_id == key_id)
            .filter(|entry| now.saturating_sub(entry.archived_at) < retention)
            .map(|entry| entry.key))
    }

    /// True if there is no current key or it is at least one rotation
    /// interval old.
    pub async fn needs_rotation(&self) -> Result<bool, E2eeError> {
        let Some(current) = self.load_current().await? else {
            return Ok(true);
        };

        let age = self.env.now_millis().saturating_sub(current.timestamp);
        Ok(age >= self.config.rotation_interval().as_millis() as u64)
    }

    /// Rotate if [`needs_rotation`](Self::needs_rotation). Returns the new key
    /// when a rotation happened.
    pub async fn rotate_if_needed(&self) -> Result<Option<SignedPreKey>, E2eeError> {
        let _guard = self.write_lock.lock().await;
        if !self.needs_rotation().await? {
            return Ok(None);
        }
        self.generate_locked().await.map(Some)
    }

    /// Generate `count` one-time prekeys with fresh, monotonically allocated
    /// ids.
    pub async fn generate_one_time_pre_keys(
        &self,
        count: u32,
    ) -> Result<Vec<OneTimePreKey>, E2eeError> {
        let _guard = self.write_lock.lock().await;

        let mut next_id = get_record::<_, u32>(
            &self.storage,
            namespace::ONE_TIME_PRE_KEYS,
            NEXT_ONE_TIME_ID_KEY,
        )
        .await?
        .unwrap_or(1);

        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = OneTimePreKey {
                key_id: next_id,
                key_pair: KeyPair::from_random(self.env.random_array()),
            };
            put_record(&self.storage, namespace::ONE_TIME_PRE_KEYS, &key.key_id.to_string(), &key)
                .await?;

            next_id = if next_id >= MAX_KEY_ID { 1 } else { next_id + 1 };
            keys.push(key);
        }

        put_record(&self.storage, namespace::ONE_TIME_PRE_KEYS, NEXT_ONE_TIME_ID_KEY, &next_id)
            .await?;

        tracing::info!(count, "generated one-time prekeys");
        Ok(keys)
    }

    /// Generate the configured batch size of one-time prekeys.
    pub async fn replenish_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKey>, E2eeError> {
        self.generate_one_time_pre_keys(self.config.one_time_batch_size).await
    }

    /// Look up an unused one-time prekey.
    pub async fn one_time_pre_key(&self, key_id: u32) -> Result<Option<OneTimePreKey>, E2eeError> {
        Ok(get_record(&self.storage, namespace::ONE_TIME_PRE_KEYS, &key_id.to_string()).await?)
    }

    /// Delete a one-time prekey after it has been consumed.
    pub async fn remove_one_time_pre_key(&self, key_id: u32) -> Result<(), E2eeError> {
        self.storage.delete(namespace::ONE_TIME_PRE_KEYS, &key_id.to_string()).await?;
        Ok(())
    }

    /// Ids of all unused one-time prekeys, ascending.
    pub async fn one_time_pre_key_ids(&self) -> Result<Vec<u32>, E2eeError> {
        let mut ids: Vec<u32> = self
            .storage
            .list(namespace::ONE_TIME_PRE_KEYS)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Bundle to publish for `device_id`: the current signed prekey and the
    /// oldest unused one-time prekey, if any remain.
    pub async fn pre_key_bundle(&self, device_id: u32) -> Result<PreKeyBundle, E2eeError> {
        let signed = self.current_signed_pre_key().await?;

        let mut one_time_pre_key = None;
        for id in self.one_time_pre_key_ids().await? {
            if let Some(key) = self.one_time_pre_key(id).await? {
                one_time_pre_key = Some((key.key_id, *key.public_key()));
                break;
            }
        }

        Ok(PreKeyBundle {
            registration_id: self.identity.registration_id(),
            device_id,
            identity_key: self.identity.identity_key(),
            signed_pre_key_id: signed.key_id,
            signed_pre_key: *signed.public_key(),
            signed_pre_key_signature: signed.signature,
            one_time_pre_key,
        })
    }

    async fn generate_locked(&self) -> Result<SignedPreKey, E2eeError> {
        let previous = self.load_current().await?;
        let now = self.env.now_millis();

        let key_id = match &previous {
            Some(previous) => next_key_id(previous.key_id),
            None => next_key_id(self.env.random_u32() & MAX_KEY_ID),
        };
        let key_pair = KeyPair::from_random(self.env.random_array());
        let signature = self.identity.identity_key_pair().sign(&key_pair.public_key().encode());
        let key = SignedPreKey { key_id, key_pair, signature, timestamp: now };

        if let Some(previous) = previous {
            self.archive(previous, now).await?;
        }
        put_record(&self.storage, namespace::SIGNED_PRE_KEYS, CURRENT_KEY, &key).await?;

        tracing::info!(key_id, "generated signed prekey");
        Ok(key)
    }

    async fn archive(&self, key: SignedPreKey, now: u64) -> Result<(), E2eeError> {
        let retention = self.config.archive_retention().as_millis() as u64;

        let mut archive = self.load_archive().await?;
        let before = archive.len();
        archive.retain(|entry| now.saturating_sub(entry.archived_at) < retention);

        let pruned = before - archive.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired signed prekeys");
        }

        archive.push(ArchivedSignedPreKey { key, archived_at: now });
        put_record(&self.storage, namespace::SIGNED_PRE_KEYS, ARCHIVE_KEY, &archive).await?;
        Ok(())
    }

    async fn load_current(&self) -> Result<Option<SignedPreKey>, E2eeError> {
        Ok(get_record(&self.storage, namespace::SIGNED_PRE_KEYS, CURRENT_KEY).await?)
    }

    async fn load_archive(&self) -> Result<Vec<ArchivedSignedPreKey>, E2eeError> {
        Ok(get_record(&self.storage, namespace::SIGNED_PRE_KEYS, ARCHIVE_KEY)
            .await?
            .unwrap_or_default())
    }
}

/// Next 24-bit key id, skipping zero.
fn next_key_id(id: u32) -> u32 {
    let next = (id + 1) & MAX_KEY_ID;
    if next == 0 { 1 } else { next }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::test_env::TestEnv, identity::LocalIdentity, storage::MemoryStorage};

    fn manager(env: &TestEnv) -> PreKeyManager<MemoryStorage, TestEnv> {
        let identity = Arc::new(LocalIdentity::generate(env));
        PreKeyManager::new(MemoryStorage::new(), env.clone(), identity, PreKeyConfig::default())
    }

    #[tokio::test]
    async fn current_is_generated_lazily_and_stable() {
        let env = TestEnv::new(1);
        let manager = manager(&env);

        let first = manager.current_signed_pre_key().await.unwrap();
        let second = manager.current_signed_pre_key().await.unwrap();

        assert_eq!(first, second);
        assert!(first.key_id() <= MAX_KEY_ID && first.key_id() != 0);
        first.verify(&manager.identity.identity_key()).unwrap();
    }

    #[tokio::test]
    async fn rotation_after_seven_days() {
        let env = TestEnv::new(2);
        let manager = manager(&env);

        assert!(manager.needs_rotation().await.unwrap(), "no key yet");
        manager.generate_signed_pre_key().await.unwrap();
        assert!(!manager.needs_rotation().await.unwrap());

        env.advance_days(6);
        assert!(!manager.needs_rotation().await.unwrap());
        assert!(manager.rotate_if_needed().await.unwrap().is_none());

        env.advance_days(1);
        assert!(manager.needs_rotation().await.unwrap());
        let rotated = manager.rotate_if_needed().await.unwrap();
        assert!(rotated.is_some());
        assert!(!manager.needs_rotation().await.unwrap());
    }

    #[tokio::test]
    async fn superseded_key_retrievable_for_thirty_days() {
        let env = TestEnv::new(3);
        let manager = manager(&env);

        let old = manager.generate_signed_pre_key().await.unwrap();
        let new = manager.generate_signed_pre_key().await.unwrap();
        assert_ne!(old.key_id(), new.key_id());

        assert_eq!(manager.signed_pre_key(old.key_id()).await.unwrap(), Some(old.clone()));
        assert_eq!(manager.signed_pre_key(new.key_id()).await.unwrap(), Some(new.clone()));

        env.advance_days(29);
        assert!(manager.signed_pre_key(old.key_id()).await.unwrap().is_some());

        env.advance_days(1);
        assert!(manager.signed_pre_key(old.key_id()).await.unwrap().is_none());
        let current = manager.signed_pre_key(new.key_id()).await.unwrap();
        assert!(current.is_some(), "current never expires");
    }

    #[tokio::test]
    async fn archive_is_pruned_on_write() {
        let env = TestEnv::new(4);
        let manager = manager(&env);

        manager.generate_signed_pre_key().await.unwrap();
        manager.generate_signed_pre_key().await.unwrap();
        env.advance_days(31);
        manager.generate_signed_pre_key().await.unwrap();

        let archive = manager.load_archive().await.unwrap();
        assert_eq!(archive.len(), 1, "only the key archived just now remains");
    }

    #[tokio::test]
    async fn tampered_signature_fails_verification() {
        let env = TestEnv::new(5);
        let manager = manager(&env);

        let mut key = manager.current_signed_pre_key().await.unwrap();
        let other = LocalIdentity::generate(&env);
        key.signature = other.identity_key_pair().sign(&key.public_key().encode());

        assert_eq!(
            key.verify(&manager.identity.identity_key()).unwrap_err(),
            E2eeError::InvalidSignature
        );
    }

    #[tokio::test]
    async fn one_time_pre_keys_lifecycle() {
        let env = TestEnv::new(6);
        let manager = manager(&env);

        let batch = manager.generate_one_time_pre_keys(3).await.unwrap();
        let ids: Vec<u32> = batch.iter().map(OneTimePreKey::key_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let more = manager.generate_one_time_pre_keys(2).await.unwrap();
        assert_eq!(more[0].key_id(), 4, "ids keep increasing across batches");

        assert_eq!(manager.one_time_pre_key(2).await.unwrap(), Some(batch[1].clone()));
        manager.remove_one_time_pre_key(2).await.unwrap();
        assert_eq!(manager.one_time_pre_key(2).await.unwrap(), None);
        assert_eq!(manager.one_time_pre_key_ids().await.unwrap(), vec![1, 3, 4, 5]);
    }

    #[tokio::test]
    async fn bundle_carries_current_and_oldest_one_time_key() {
        let env = TestEnv::new(7);
        let manager = manager(&env);

        let bundle = manager.pre_key_bundle(1).await.unwrap();
        assert!(bundle.one_time_pre_key.is_none());
        bundle.verify().unwrap();

        let keys = manager.generate_one_time_pre_keys(2).await.unwrap();
        let bundle = manager.pre_key_bundle(1).await.unwrap();
        let current = manager.current_signed_pre_key().await.unwrap();

        assert_eq!(bundle.signed_pre_key_id, current.key_id());
        assert_eq!(bundle.one_time_pre_key, Some((keys[0].key_id(), *keys[0].public_key())));
        assert_eq!(bundle.registration_id, manager.identity.registration_id());
    }

    #[test]
    fn key_ids_wrap_within_24_bits() {
        assert_eq!(next_key_id(5), 6);
        assert_eq!(next_key_id(MAX_KEY_ID), 1);
    }
}
