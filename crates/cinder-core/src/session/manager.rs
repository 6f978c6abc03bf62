//! Session lifecycle: creation from bundles and prekey messages,
//! transactional encrypt/decrypt, expiry.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use cinder_crypto::IdentityKey;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};

use super::{
    message::CiphertextMessage,
    state::{SessionState, SessionSummary},
};
use crate::{
    E2eeError,
    config::SessionConfig,
    env::Environment,
    identity::IdentityManager,
    locks::KeyedLocks,
    prekey::PreKeyManager,
    storage::{Storage, get_record, namespace, put_record},
    x3dh::{self, PreKeyBundle, PreKeyMessage},
};

/// A remote user's device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    /// User id
    pub user_id: String,
    /// Device id
    pub device_id: u32,
}

impl PeerAddress {
    /// Address of `user_id`'s device `device_id`.
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self { user_id: user_id.into(), device_id }
    }

    fn storage_key(&self) -> String {
        format!("{}.{}", hex::encode(self.user_id.as_bytes()), self.device_id)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    address: PeerAddress,
    state: SessionState,
}

/// Owns every pairwise Double Ratchet session of this device.
///
/// The in-memory map is authoritative at runtime; storage mirrors it. Every
/// mutation runs on a copy under the peer's lock, is written to storage, and
/// only then replaces the in-memory state. A failure at any step leaves both
/// untouched.
pub struct SessionManager<S: Storage, E: Environment> {
    storage: S,
    env: E,
    identity: Arc<dyn IdentityManager>,
    prekeys: Arc<PreKeyManager<S, E>>,
    config: SessionConfig,
    sessions: RwLock<HashMap<PeerAddress, SessionState>>,
    locks: KeyedLocks<PeerAddress>,
    initialized: OnceCell<()>,
}

impl<S: Storage, E: Environment> SessionManager<S, E> {
    /// Create a manager. Stored sessions are loaded on first use.
    pub fn new(
        storage: S,
        env: E,
        identity: Arc<dyn IdentityManager>,
        prekeys: Arc<PreKeyManager<S, E>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            storage,
            env,
            identity,
            prekeys,
            config,
            sessions: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            initialized: OnceCell::new(),
        }
    }

    /// Load stored sessions. Idempotent; only the first call does work.
    pub async fn initialize(&self) -> Result<(), E2eeError> {
        self.initialized
            .get_or_try_init(|| async {
                let keys = self.storage.list(namespace::SESSIONS).await?;
                let mut loaded = HashMap::with_capacity(keys.len());
                for key in keys {
                    if let Some(stored) =
                        get_record::<_, StoredSession>(&self.storage, namespace::SESSIONS, &key)
                            .await?
                    {
                        loaded.insert(stored.address, stored.state);
                    }
                }

                let count = loaded.len();
                self.sessions.write().await.extend(loaded);
                tracing::debug!(count, "loaded sessions");
                Ok::<(), E2eeError>(())
            })
            .await?;
        Ok(())
    }

    /// Start a session with `peer` from its published bundle.
    ///
    /// Replaces any existing session. Returns the X3DH header that
    /// accompanies outgoing messages until the peer replies.
    pub async fn create_session(
        &self,
        peer: &PeerAddress,
        bundle: &PreKeyBundle,
    ) -> Result<PreKeyMessage, E2eeError> {
        self.initialize().await?;
        let _guard = self.locks.lock(peer).await;

        let identity = self.identity.identity_key_pair();
        let (secret, ephemeral) = x3dh::initiator_calculate_secret(identity, bundle, &self.env)?;
        let keys = x3dh::derive_initial_keys(&secret);

        let initial = x3dh::create_initial_message(
            identity.public_key(),
            self.identity.registration_id(),
            *ephemeral.public_key(),
            bundle,
        );
        let mut state = SessionState::initiator(
            identity.public_key(),
            &initial,
            bundle.identity_key,
            keys,
            ephemeral,
            self.env.now_millis(),
        );
        if let Some(previous) = self.session(peer).await? {
            state.supersede(&previous);
        }

        self.commit(peer, state).await?;
        tracing::info!(
            %peer,
            one_time_pre_key = secret.used_one_time_pre_key(),
            "created session as initiator"
        );
        Ok(initial)
    }

    /// Build and store the responder side of a session from a peer's X3DH
    /// header.
    pub async fn create_session_from_pre_key_message(
        &self,
        peer: &PeerAddress,
        message: &PreKeyMessage,
    ) -> Result<(), E2eeError> {
        self.initialize().await?;
        let _guard = self.locks.lock(peer).await;

        let existing = self.session(peer).await?;
        if existing.as_ref().is_some_and(|state| state.is_superseded_handshake(&message.base_key)) {
            tracing::debug!(%peer, "prekey message from a superseded handshake");
            return Err(E2eeError::DuplicateMessage);
        }

        let mut state = self.responder_state(message).await?;
        if let Some(previous) = &existing {
            state.supersede(previous);
        }
        self.commit(peer, state).await?;
        self.consume_one_time_pre_key(message).await;

        tracing::info!(%peer, "created session as responder");
        Ok(())
    }

    /// Encrypt `plaintext` for `peer`.
    ///
    /// Until the peer has replied, the result is a `PreKey` message carrying
    /// the X3DH header.
    pub async fn encrypt(
        &self,
        peer: &PeerAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, E2eeError> {
        self.initialize().await?;
        let _guard = self.locks.lock(peer).await;

        let mut state = self.session(peer).await?.ok_or(E2eeError::NoSession)?;
        let message = state.encrypt(plaintext, &self.env)?;

        let ciphertext = match &state.pending_pre_key {
            Some(pending) => CiphertextMessage::PreKey {
                pre_key: PreKeyMessage {
                    registration_id: pending.registration_id,
                    identity_key: state.local_identity_key,
                    base_key: state.base_key,
                    signed_pre_key_id: pending.signed_pre_key_id,
                    one_time_pre_key_id: pending.one_time_pre_key_id,
                },
                message,
            },
            None => CiphertextMessage::Ratchet(message),
        };

        self.commit(peer, state).await?;
        Ok(ciphertext)
    }

    /// Decrypt a message from `peer`.
    ///
    /// A `PreKey` message with an unknown base key creates (or replaces) the
    /// session; one with the current base key reuses it. Base keys of
    /// replaced sessions are refused as duplicates. The one-time prekey is
    /// consumed only once the session has been committed.
    pub async fn decrypt(
        &self,
        peer: &PeerAddress,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>, E2eeError> {
        self.initialize().await?;
        let _guard = self.locks.lock(peer).await;

        let existing = self.session(peer).await?;

        match message {
            CiphertextMessage::PreKey { pre_key, message } => {
                let (mut state, is_new) = match existing {
                    Some(state) if state.base_key == pre_key.base_key => (state, false),
                    Some(state) if state.is_superseded_handshake(&pre_key.base_key) => {
                        tracing::debug!(%peer, "prekey message from a superseded handshake");
                        return Err(E2eeError::DuplicateMessage);
                    },
                    existing => {
                        let mut state = self.responder_state(pre_key).await?;
                        if let Some(previous) = &existing {
                            tracing::info!(%peer, "peer restarted handshake, replacing session");
                            state.supersede(previous);
                        }
                        (state, true)
                    },
                };

                let plaintext = state.decrypt(message, &self.config, &self.env)?;
                self.commit(peer, state).await?;

                if is_new {
                    self.consume_one_time_pre_key(pre_key).await;
                    tracing::info!(%peer, "created session as responder");
                }
                Ok(plaintext)
            },
            CiphertextMessage::Ratchet(message) => {
                let mut state = existing.ok_or(E2eeError::NoSession)?;
                let plaintext = state.decrypt(message, &self.config, &self.env)?;

                // A decrypted reply proves the peer holds the session
                state.pending_pre_key = None;

                self.commit(peer, state).await?;
                Ok(plaintext)
            },
        }
    }

    /// Key-free view of the session with `peer`.
    pub async fn session_summary(
        &self,
        peer: &PeerAddress,
    ) -> Result<Option<SessionSummary>, E2eeError> {
        Ok(self.session(peer).await?.map(|state| state.summary()))
    }

    /// True if a session with `peer` exists.
    pub async fn has_session(&self, peer: &PeerAddress) -> Result<bool, E2eeError> {
        Ok(self.session(peer).await?.is_some())
    }

    /// Identity key the session with `peer` was established with.
    pub async fn remote_identity(
        &self,
        peer: &PeerAddress,
    ) -> Result<Option<IdentityKey>, E2eeError> {
        Ok(self.session(peer).await?.map(|state| state.remote_identity_key))
    }

    /// Addresses of all peers with a session.
    pub async fn peers(&self) -> Result<Vec<PeerAddress>, E2eeError> {
        self.initialize().await?;
        let mut peers: Vec<PeerAddress> = self.sessions.read().await.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    /// Delete the session with `peer`. Its ratchet state is unrecoverable
    /// afterwards.
    pub async fn delete_session(&self, peer: &PeerAddress) -> Result<(), E2eeError> {
        self.initialize().await?;
        let _guard = self.locks.lock(peer).await;

        self.remove(peer).await?;
        tracing::info!(%peer, "deleted session");
        Ok(())
    }

    /// Delete sessions idle for at least `max_age`. Returns how many were
    /// removed.
    pub async fn cleanup_old_sessions(&self, max_age: Duration) -> Result<usize, E2eeError> {
        self.initialize().await?;

        let now = self.env.now_millis();
        let max_age = max_age.as_millis() as u64;
        let is_stale = |state: &SessionState| now.saturating_sub(state.last_activity_at) >= max_age;

        let candidates: Vec<PeerAddress> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, state)| is_stale(state))
            .map(|(peer, _)| peer.clone())
            .collect();

        let mut removed = 0;
        for peer in candidates {
            let _guard = self.locks.lock(&peer).await;
            // Re-check: the session may have been used while we waited
            let still_stale = self.sessions.read().await.get(&peer).is_some_and(is_stale);
            if still_stale {
                self.remove(&peer).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned idle sessions");
        }
        Ok(removed)
    }

    /// Delete sessions idle longer than the configured session timeout.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize, E2eeError> {
        self.cleanup_old_sessions(self.config.session_timeout()).await
    }

    async fn session(&self, peer: &PeerAddress) -> Result<Option<SessionState>, E2eeError> {
        self.initialize().await?;
        Ok(self.sessions.read().await.get(peer).cloned())
    }

    /// Persist `state`, then make it the in-memory state.
    async fn commit(&self, peer: &PeerAddress, state: SessionState) -> Result<(), E2eeError> {
        let stored = StoredSession { address: peer.clone(), state };
        put_record(&self.storage, namespace::SESSIONS, &peer.storage_key(), &stored).await?;
        self.sessions.write().await.insert(stored.address, stored.state);
        Ok(())
    }

    async fn remove(&self, peer: &PeerAddress) -> Result<(), E2eeError> {
        self.storage.delete(namespace::SESSIONS, &peer.storage_key()).await?;
        self.sessions.write().await.remove(peer);
        Ok(())
    }

    async fn responder_state(&self, message: &PreKeyMessage) -> Result<SessionState, E2eeError> {
        let signed_pre_key = self
            .prekeys
            .signed_pre_key(message.signed_pre_key_id)
            .await?
            .ok_or_else(|| {
                tracing::debug!(key_id = message.signed_pre_key_id, "unknown signed prekey");
                E2eeError::KeyNotFound
            })?;

        let one_time_pre_key = match message.one_time_pre_key_id {
            Some(key_id) => {
                let key = self.prekeys.one_time_pre_key(key_id).await?;
                if key.is_none() {
                    tracing::warn!(key_id, "one-time prekey missing, falling back to three-DH");
                }
                key
            },
            None => None,
        };

        let identity = self.identity.identity_key_pair();
        let secret = x3dh::responder_calculate_secret(
            identity,
            signed_pre_key.key_pair(),
            one_time_pre_key.as_ref().map(|key| key.key_pair()),
            &message.identity_key,
            &message.base_key,
        )?;

        Ok(SessionState::responder(
            identity.public_key(),
            message.identity_key,
            message.base_key,
            x3dh::derive_initial_keys(&secret),
            self.env.now_millis(),
        ))
    }

    /// Delete the one-time prekey a committed session used. The session is
    /// already durable, so a failure here only leaves the key behind.
    async fn consume_one_time_pre_key(&self, message: &PreKeyMessage) {
        let Some(key_id) = message.one_time_pre_key_id else {
            return;
        };
        if let Err(err) = self.prekeys.remove_one_time_pre_key(key_id).await {
            tracing::warn!(key_id, error = %err, "failed to delete consumed one-time prekey");
        }
    }
}
