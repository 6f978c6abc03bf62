//! Sender-key lifecycle: creation, distribution, group encrypt/decrypt,
//! rotation and member removal.

use cinder_crypto::{Secret, SigningKeyPair, SymmetricRatchet, aead};

use super::{
    message::{SenderKeyDistributionMessage, SenderKeyMessage},
    state::{
        ReceivedSenderKey, SenderKeyState, group_prefix, incoming_key, member_prefix, outgoing_key,
    },
};
use crate::{
    E2eeError,
    codec::MAX_KEY_ID,
    config::SenderKeyConfig,
    env::Environment,
    locks::KeyedLocks,
    storage::{Storage, get_record, namespace, put_record},
};

/// Sender keys of the local user (one per group) and those received from
/// other members.
///
/// Storage is the only copy. Each outgoing key is mutated under its group's
/// lock and each received key under its `(group, sender, key_id)` lock; the
/// updated chain is persisted before the result is returned, so a failed
/// write leaves the ratchet where it was.
pub struct SenderKeyManager<S: Storage, E: Environment> {
    storage: S,
    env: E,
    local_sender_id: String,
    config: SenderKeyConfig,
    outgoing_locks: KeyedLocks<String>,
    incoming_locks: KeyedLocks<String>,
}

impl<S: Storage, E: Environment> SenderKeyManager<S, E> {
    /// Manager sending as `local_sender_id`.
    pub fn new(
        storage: S,
        env: E,
        local_sender_id: impl Into<String>,
        config: SenderKeyConfig,
    ) -> Self {
        Self {
            storage,
            env,
            local_sender_id: local_sender_id.into(),
            config,
            outgoing_locks: KeyedLocks::new(),
            incoming_locks: KeyedLocks::new(),
        }
    }

    /// User id stamped on outgoing distribution messages.
    pub fn local_sender_id(&self) -> &str {
        &self.local_sender_id
    }

    /// Create (or replace) our sender key for `group_id`. Returns its key id.
    ///
    /// # Errors
    ///
    /// - `InvalidMessage`: group id does not fit the wire format
    /// - `Storage`: the key could not be persisted
    pub async fn create_sender_key(&self, group_id: &str) -> Result<u32, E2eeError> {
        let _guard = self.outgoing_locks.lock(&group_id.to_string()).await;
        self.create_locked(group_id).await
    }

    async fn create_locked(&self, group_id: &str) -> Result<u32, E2eeError> {
        if group_id.len() > usize::from(u16::MAX) {
            return Err(E2eeError::InvalidMessage);
        }

        let previous = self.outgoing(group_id).await?.map(|state| state.key_id);
        let key_id = loop {
            let candidate = self.env.random_u32() & MAX_KEY_ID;
            if candidate != 0 && Some(candidate) != previous {
                break candidate;
            }
        };

        let state = SenderKeyState {
            group_id: group_id.to_string(),
            key_id,
            chain: SymmetricRatchet::new(Secret::from_bytes(self.env.random_array()), 0),
            signing_key: SigningKeyPair::from_random(self.env.random_array()),
            created_at: self.env.now_millis(),
        };
        put_record(&self.storage, namespace::OUTGOING_SENDER_KEYS, &outgoing_key(group_id), &state)
            .await?;

        tracing::info!(group_id, key_id, "created sender key");
        Ok(key_id)
    }

    /// Package our current sender key for delivery to the other members.
    ///
    /// The result contains the chain key; it must only be sent through a
    /// pairwise session.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: no sender key for `group_id`
    pub async fn create_distribution_message(
        &self,
        group_id: &str,
    ) -> Result<SenderKeyDistributionMessage, E2eeError> {
        let state = self.outgoing(group_id).await?.ok_or(E2eeError::KeyNotFound)?;
        Ok(self.distribution(state))
    }

    fn distribution(&self, state: SenderKeyState) -> SenderKeyDistributionMessage {
        let signing_key = *state.signing_key.public_key();
        let (chain_key, iteration) = state.chain.into_parts();
        SenderKeyDistributionMessage {
            group_id: state.group_id,
            key_id: state.key_id,
            iteration,
            chain_key,
            signing_key,
            sender_id: self.local_sender_id.clone(),
        }
    }

    /// Store (or replace) the sender key `sender_id` distributed for a group.
    ///
    /// # Errors
    ///
    /// - `InvalidMessage`: the message names a different sender than the
    ///   channel it arrived on
    pub async fn process_sender_key_distribution(
        &self,
        sender_id: &str,
        distribution: &SenderKeyDistributionMessage,
    ) -> Result<(), E2eeError> {
        if distribution.sender_id != sender_id {
            tracing::warn!(
                sender_id,
                claimed = %distribution.sender_id,
                "distribution message names another sender"
            );
            return Err(E2eeError::InvalidMessage);
        }

        let key = incoming_key(&distribution.group_id, sender_id, distribution.key_id);
        let _guard = self.incoming_locks.lock(&key).await;

        let received = ReceivedSenderKey {
            group_id: distribution.group_id.clone(),
            sender_id: sender_id.to_string(),
            key_id: distribution.key_id,
            chain: SymmetricRatchet::new(distribution.chain_key.clone(), distribution.iteration),
            signing_key: distribution.signing_key,
            received_at: self.env.now_millis(),
        };
        put_record(&self.storage, namespace::INCOMING_SENDER_KEYS, &key, &received).await?;

        tracing::info!(
            group_id = %distribution.group_id,
            sender_id,
            key_id = distribution.key_id,
            iteration = distribution.iteration,
            "stored sender key"
        );
        Ok(())
    }

    /// Encrypt `plaintext` once for every member of `group_id`.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: no sender key for `group_id`
    /// - `OutdatedMessage`: the chain is exhausted
    pub async fn encrypt_group_message(
        &self,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<SenderKeyMessage, E2eeError> {
        let _guard = self.outgoing_locks.lock(&group_id.to_string()).await;

        let mut state = self.outgoing(group_id).await?.ok_or(E2eeError::KeyNotFound)?;
        let message_key = state.chain.advance()?;
        let iteration = message_key.counter();

        let associated_data = SenderKeyMessage::associated_data(group_id, state.key_id, iteration);
        let ciphertext =
            aead::encrypt(message_key.key(), self.env.random_array(), plaintext, &associated_data);
        let signature = state.signing_key.sign(&SenderKeyMessage::signed_bytes(
            group_id,
            state.key_id,
            iteration,
            &ciphertext,
        ));

        put_record(&self.storage, namespace::OUTGOING_SENDER_KEYS, &outgoing_key(group_id), &state)
            .await?;

        if state.chain.counter() == self.config.rotation_threshold {
            tracing::warn!(
                group_id,
                key_id = state.key_id,
                iteration = state.chain.counter(),
                "sender key reached rotation threshold"
            );
        }

        Ok(SenderKeyMessage {
            group_id: group_id.to_string(),
            key_id: state.key_id,
            iteration,
            ciphertext,
            signature,
        })
    }

    /// Decrypt a group message from `sender_id`.
    ///
    /// The signature is checked before any ratchet or AEAD work. Iterations
    /// below the stored one are replays; more than `max_future_iterations`
    /// ahead are refused.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: no sender key from `sender_id` with this key id
    /// - `InvalidSignature`: signature does not verify
    /// - `DuplicateMessage`: iteration already consumed
    /// - `OutdatedMessage`: iteration too far ahead
    /// - `DecryptionFailed`: AEAD rejected the ciphertext
    pub async fn decrypt_group_message(
        &self,
        sender_id: &str,
        message: &SenderKeyMessage,
    ) -> Result<Vec<u8>, E2eeError> {
        let key = incoming_key(&message.group_id, sender_id, message.key_id);
        let _guard = self.incoming_locks.lock(&key).await;

        let Some(mut received) =
            get_record::<_, ReceivedSenderKey>(&self.storage, namespace::INCOMING_SENDER_KEYS, &key)
                .await?
        else {
            tracing::debug!(
                group_id = %message.group_id,
                sender_id,
                key_id = message.key_id,
                "no sender key for message"
            );
            return Err(E2eeError::KeyNotFound);
        };

        message.verify(&received.signing_key)?;

        let current = received.chain.counter();
        if message.iteration < current {
            tracing::debug!(iteration = message.iteration, current, "replayed group message");
            return Err(E2eeError::DuplicateMessage);
        }
        if message.iteration - current > self.config.max_future_iterations {
            tracing::debug!(iteration = message.iteration, current, "group message too far ahead");
            return Err(E2eeError::OutdatedMessage);
        }

        let message_key =
            received.chain.advance_to(message.iteration, self.config.max_future_iterations)?;
        let associated_data =
            SenderKeyMessage::associated_data(&message.group_id, message.key_id, message.iteration);
        let plaintext = aead::decrypt(message_key.key(), &message.ciphertext, &associated_data)?;

        put_record(&self.storage, namespace::INCOMING_SENDER_KEYS, &key, &received).await?;
        Ok(plaintext)
    }

    /// Replace our sender key for `group_id` and return the new
    /// distribution message. Call on every membership change.
    pub async fn rotate_sender_key(
        &self,
        group_id: &str,
    ) -> Result<SenderKeyDistributionMessage, E2eeError> {
        let _guard = self.outgoing_locks.lock(&group_id.to_string()).await;

        self.create_locked(group_id).await?;
        let state = self.outgoing(group_id).await?.ok_or(E2eeError::KeyNotFound)?;

        tracing::info!(group_id, key_id = state.key_id, "rotated sender key");
        Ok(self.distribution(state))
    }

    /// Forget our sender key and every received key for `group_id`.
    pub async fn delete_sender_key_for_group(&self, group_id: &str) -> Result<(), E2eeError> {
        {
            let _guard = self.outgoing_locks.lock(&group_id.to_string()).await;
            self.storage.delete(namespace::OUTGOING_SENDER_KEYS, &outgoing_key(group_id)).await?;
        }

        let removed = self.delete_incoming_with_prefix(&group_prefix(group_id)).await?;
        tracing::info!(group_id, received_keys = removed, "deleted group sender keys");
        Ok(())
    }

    /// Forget every key received from `sender_id` in `group_id`.
    ///
    /// Does not rotate our own key; the caller decides when to.
    pub async fn remove_sender_keys_for_member(
        &self,
        group_id: &str,
        sender_id: &str,
    ) -> Result<usize, E2eeError> {
        let removed = self.delete_incoming_with_prefix(&member_prefix(group_id, sender_id)).await?;
        tracing::info!(group_id, sender_id, removed, "removed member sender keys");
        Ok(removed)
    }

    /// Iteration our next message in `group_id` will use.
    pub async fn sender_key_iteration(&self, group_id: &str) -> Result<Option<u32>, E2eeError> {
        Ok(self.outgoing(group_id).await?.map(|state| state.chain.counter()))
    }

    /// Key id of our current sender key in `group_id`.
    pub async fn sender_key_id(&self, group_id: &str) -> Result<Option<u32>, E2eeError> {
        Ok(self.outgoing(group_id).await?.map(|state| state.key_id))
    }

    /// Next iteration we accept from `sender_id` under `key_id`.
    pub async fn received_iteration(
        &self,
        group_id: &str,
        sender_id: &str,
        key_id: u32,
    ) -> Result<Option<u32>, E2eeError> {
        let key = incoming_key(group_id, sender_id, key_id);
        let received =
            get_record::<_, ReceivedSenderKey>(&self.storage, namespace::INCOMING_SENDER_KEYS, &key)
                .await?;
        Ok(received.map(|received| received.chain.counter()))
    }

    async fn outgoing(&self, group_id: &str) -> Result<Option<SenderKeyState>, E2eeError> {
        let key = outgoing_key(group_id);
        Ok(get_record(&self.storage, namespace::OUTGOING_SENDER_KEYS, &key).await?)
    }

    async fn delete_incoming_with_prefix(&self, prefix: &str) -> Result<usize, E2eeError> {
        let keys: Vec<String> = self
            .storage
            .list(namespace::INCOMING_SENDER_KEYS)
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();

        for key in &keys {
            let _guard = self.incoming_locks.lock(key).await;
            self.storage.delete(namespace::INCOMING_SENDER_KEYS, key).await?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::{env::test_env::TestEnv, storage::MemoryStorage};

    const GROUP: &str = "group-1";

    type Manager = SenderKeyManager<MemoryStorage, TestEnv>;

    fn manager(sender: &str, env: &TestEnv) -> Manager {
        SenderKeyManager::new(MemoryStorage::new(), env.clone(), sender, SenderKeyConfig::default())
    }

    /// Alice has a sender key for GROUP and Bob has received it.
    async fn pair(seed: u64) -> (Manager, Manager) {
        let env = TestEnv::new(seed);
        let alice = manager("alice", &env);
        let bob = manager("bob", &env);

        alice.create_sender_key(GROUP).await.unwrap();
        let distribution = alice.create_distribution_message(GROUP).await.unwrap();
        bob.process_sender_key_distribution("alice", &distribution).await.unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn round_trip_and_monotonic_iteration() {
        let (alice, bob) = pair(1).await;

        for i in 0..5u32 {
            let plaintext = format!("msg {i}");
            let message = alice.encrypt_group_message(GROUP, plaintext.as_bytes()).await.unwrap();
            assert_eq!(message.iteration, i);
            let decrypted = bob.decrypt_group_message("alice", &message).await.unwrap();
            assert_eq!(decrypted, plaintext.as_bytes());
        }
        assert_eq!(alice.sender_key_iteration(GROUP).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn replay_is_duplicate() {
        let (alice, bob) = pair(2).await;
        let message = alice.encrypt_group_message(GROUP, b"once").await.unwrap();

        bob.decrypt_group_message("alice", &message).await.unwrap();
        assert_eq!(
            bob.decrypt_group_message("alice", &message).await.unwrap_err(),
            E2eeError::DuplicateMessage
        );
    }

    #[tokio::test]
    async fn skipped_iterations_become_unreachable() {
        let (alice, bob) = pair(3).await;
        let first = alice.encrypt_group_message(GROUP, b"first").await.unwrap();
        let second = alice.encrypt_group_message(GROUP, b"second").await.unwrap();

        assert_eq!(bob.decrypt_group_message("alice", &second).await.unwrap(), b"second");
        assert_eq!(
            bob.decrypt_group_message("alice", &first).await.unwrap_err(),
            E2eeError::DuplicateMessage
        );
    }

    #[tokio::test]
    async fn forged_signature_rejected_before_state_changes() {
        let (alice, bob) = pair(4).await;
        let mut message = alice.encrypt_group_message(GROUP, b"real").await.unwrap();
        let key_id = message.key_id;

        message.ciphertext[0] ^= 1;
        assert_eq!(
            bob.decrypt_group_message("alice", &message).await.unwrap_err(),
            E2eeError::InvalidSignature
        );
        assert_eq!(bob.received_iteration(GROUP, "alice", key_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn future_bound_is_enforced() {
        let (alice, bob) = pair(5).await;
        let config = SenderKeyConfig::default();

        // Re-sign a message claiming a far-future iteration with Alice's key
        let state = alice.outgoing(GROUP).await.unwrap().unwrap();
        let forge = |iteration: u32| {
            let ciphertext = vec![0u8; 40];
            let signature = state.signing_key.sign(&SenderKeyMessage::signed_bytes(
                GROUP,
                state.key_id,
                iteration,
                &ciphertext,
            ));
            SenderKeyMessage {
                group_id: GROUP.into(),
                key_id: state.key_id,
                iteration,
                ciphertext,
                signature,
            }
        };

        assert_eq!(
            bob.decrypt_group_message("alice", &forge(config.max_future_iterations + 1))
                .await
                .unwrap_err(),
            E2eeError::OutdatedMessage
        );
        // Inside the window it reaches the AEAD and fails there
        assert_eq!(
            bob.decrypt_group_message("alice", &forge(config.max_future_iterations))
                .await
                .unwrap_err(),
            E2eeError::DecryptionFailed
        );
        assert_eq!(bob.received_iteration(GROUP, "alice", state.key_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn late_joiner_starts_at_current_iteration() {
        let env = TestEnv::new(6);
        let alice = manager("alice", &env);
        let carol = manager("carol", &env);

        alice.create_sender_key(GROUP).await.unwrap();
        let early = alice.encrypt_group_message(GROUP, b"before carol").await.unwrap();

        let distribution = alice.create_distribution_message(GROUP).await.unwrap();
        assert_eq!(distribution.iteration, 1);
        carol.process_sender_key_distribution("alice", &distribution).await.unwrap();

        assert_eq!(
            carol.decrypt_group_message("alice", &early).await.unwrap_err(),
            E2eeError::DuplicateMessage
        );
        let later = alice.encrypt_group_message(GROUP, b"welcome").await.unwrap();
        assert_eq!(carol.decrypt_group_message("alice", &later).await.unwrap(), b"welcome");
    }

    #[tokio::test]
    async fn distribution_sender_must_match_channel() {
        let env = TestEnv::new(7);
        let alice = manager("alice", &env);
        let bob = manager("bob", &env);

        alice.create_sender_key(GROUP).await.unwrap();
        let distribution = alice.create_distribution_message(GROUP).await.unwrap();
        assert_eq!(
            bob.process_sender_key_distribution("mallory", &distribution).await.unwrap_err(),
            E2eeError::InvalidMessage
        );
    }

    #[tokio::test]
    async fn rotation_produces_new_key_and_old_messages_still_decrypt() {
        let (alice, bob) = pair(8).await;
        let old_id = alice.sender_key_id(GROUP).await.unwrap().unwrap();
        let in_flight = alice.encrypt_group_message(GROUP, b"old key").await.unwrap();

        let rotated = alice.rotate_sender_key(GROUP).await.unwrap();
        assert_ne!(rotated.key_id, old_id);
        assert_eq!(rotated.iteration, 0);
        bob.process_sender_key_distribution("alice", &rotated).await.unwrap();

        let fresh = alice.encrypt_group_message(GROUP, b"new key").await.unwrap();
        assert_eq!(fresh.key_id, rotated.key_id);
        assert_eq!(bob.decrypt_group_message("alice", &fresh).await.unwrap(), b"new key");
        assert_eq!(bob.decrypt_group_message("alice", &in_flight).await.unwrap(), b"old key");
    }

    #[tokio::test]
    async fn member_removal_and_group_deletion() {
        let env = TestEnv::new(9);
        let alice = manager("alice", &env);
        let carol = manager("carol", &env);
        let bob = manager("bob", &env);

        for (name, sender) in [("alice", &alice), ("carol", &carol)] {
            sender.create_sender_key(GROUP).await.unwrap();
            sender.create_sender_key("other").await.unwrap();
            for group in [GROUP, "other"] {
                let distribution = sender.create_distribution_message(group).await.unwrap();
                bob.process_sender_key_distribution(name, &distribution).await.unwrap();
            }
        }

        assert_eq!(bob.remove_sender_keys_for_member(GROUP, "carol").await.unwrap(), 1);
        let from_carol = carol.encrypt_group_message(GROUP, b"gone").await.unwrap();
        assert_eq!(
            bob.decrypt_group_message("carol", &from_carol).await.unwrap_err(),
            E2eeError::KeyNotFound
        );
        let other = carol.encrypt_group_message("other", b"still here").await.unwrap();
        assert_eq!(bob.decrypt_group_message("carol", &other).await.unwrap(), b"still here");

        bob.create_sender_key(GROUP).await.unwrap();
        bob.delete_sender_key_for_group(GROUP).await.unwrap();
        assert_eq!(bob.sender_key_iteration(GROUP).await.unwrap(), None);
        let from_alice = alice.encrypt_group_message(GROUP, b"x").await.unwrap();
        assert_eq!(
            bob.decrypt_group_message("alice", &from_alice).await.unwrap_err(),
            E2eeError::KeyNotFound
        );
    }

    #[tokio::test]
    async fn encrypt_without_key_is_key_not_found() {
        let env = TestEnv::new(10);
        let alice = manager("alice", &env);
        assert_eq!(
            alice.encrypt_group_message(GROUP, b"x").await.unwrap_err(),
            E2eeError::KeyNotFound
        );
        assert_eq!(
            alice.create_distribution_message(GROUP).await.unwrap_err(),
            E2eeError::KeyNotFound
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_use_distinct_iterations() {
        let env = TestEnv::new(11);
        let alice = Arc::new(manager("alice", &env));
        alice.create_sender_key(GROUP).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let alice = Arc::clone(&alice);
                tokio::spawn(async move {
                    alice.encrypt_group_message(GROUP, b"x").await.unwrap().iteration
                })
            })
            .collect();

        let mut iterations = Vec::new();
        for task in tasks {
            iterations.push(task.await.unwrap());
        }
        iterations.sort_unstable();
        assert_eq!(iterations, (0..16).collect::<Vec<_>>());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_plaintext_round_trips(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            group in "[a-z0-9-]{1,24}",
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let env = TestEnv::new(12);
                let alice = manager("alice", &env);
                let bob = manager("bob", &env);
                alice.create_sender_key(&group).await.unwrap();
                let distribution = alice.create_distribution_message(&group).await.unwrap();
                bob.process_sender_key_distribution("alice", &distribution).await.unwrap();

                let message = alice.encrypt_group_message(&group, &plaintext).await.unwrap();
                let wire = SenderKeyMessage::decode(&message.encode()).unwrap();
                assert_eq!(bob.decrypt_group_message("alice", &wire).await.unwrap(), plaintext);
            });
        }
    }
}
