//! One device's view of the encryption core.
//!
//! [`E2eeClient`] wires identity, prekeys, sessions, sealed sender and
//! sender keys over a single storage backend and environment. Transport and
//! directory lookups stay with the caller: methods take bundles and return
//! wire messages.

use std::sync::Arc;

use cinder_crypto::IdentityKey;

use crate::{
    E2eeError,
    config::E2eeConfig,
    env::Environment,
    group::{SenderKeyDistributionMessage, SenderKeyManager, SenderKeyMessage},
    identity::{IdentityManager, LocalIdentity},
    prekey::PreKeyManager,
    sealed_sender::{
        self, CertificateVerifier, MessageType, SealedSenderEnvelope, SenderCertificate,
    },
    session::{CiphertextMessage, PeerAddress, SessionManager},
    storage::Storage,
    x3dh::{PreKeyBundle, PreKeyMessage},
};

/// Decrypted result of [`E2eeClient::receive_sealed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sender named by the verified certificate
    pub sender: PeerAddress,
    /// Kind of the inner message
    pub message_type: MessageType,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
}

/// Outcome of [`E2eeClient::run_maintenance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// A new signed prekey was installed
    pub rotated_signed_pre_key: bool,
    /// One-time prekeys generated to refill the pool
    pub one_time_pre_keys_generated: usize,
    /// Idle sessions deleted
    pub sessions_removed: usize,
}

/// Encryption client for one local device.
pub struct E2eeClient<S: Storage, E: Environment> {
    address: PeerAddress,
    identity: Arc<LocalIdentity>,
    env: E,
    config: E2eeConfig,
    prekeys: Arc<PreKeyManager<S, E>>,
    sessions: SessionManager<S, E>,
    sender_keys: SenderKeyManager<S, E>,
}

impl<S: Storage, E: Environment> E2eeClient<S, E> {
    /// Open the client for `address`, loading or creating its identity and
    /// signed prekey and loading stored sessions.
    pub async fn open(
        storage: S,
        env: E,
        address: PeerAddress,
        config: E2eeConfig,
    ) -> Result<Self, E2eeError> {
        let identity = Arc::new(LocalIdentity::load_or_generate(&storage, &env).await?);
        let identity_manager: Arc<dyn IdentityManager> = identity.clone();

        let prekeys = Arc::new(PreKeyManager::new(
            storage.clone(),
            env.clone(),
            Arc::clone(&identity_manager),
            config.prekeys.clone(),
        ));
        let sessions = SessionManager::new(
            storage.clone(),
            env.clone(),
            identity_manager,
            Arc::clone(&prekeys),
            config.sessions.clone(),
        );
        let sender_keys = SenderKeyManager::new(
            storage,
            env.clone(),
            address.user_id.clone(),
            config.sender_keys.clone(),
        );

        prekeys.current_signed_pre_key().await?;
        sessions.initialize().await?;

        tracing::info!(%address, "opened encryption client");
        Ok(Self { address, identity, env, config, prekeys, sessions, sender_keys })
    }

    /// This device's address.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Public identity key.
    pub fn identity_key(&self) -> IdentityKey {
        self.identity.identity_key()
    }

    /// Registration id.
    pub fn registration_id(&self) -> u32 {
        self.identity.registration_id()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &E2eeConfig {
        &self.config
    }

    /// Prekey manager.
    pub fn prekeys(&self) -> &PreKeyManager<S, E> {
        &self.prekeys
    }

    /// Session manager.
    pub fn sessions(&self) -> &SessionManager<S, E> {
        &self.sessions
    }

    /// Sender-key manager.
    pub fn sender_keys(&self) -> &SenderKeyManager<S, E> {
        &self.sender_keys
    }

    /// Bundle to publish for this device.
    pub async fn pre_key_bundle(&self) -> Result<PreKeyBundle, E2eeError> {
        self.prekeys.pre_key_bundle(self.address.device_id).await
    }

    /// Start a session with `peer` from its bundle.
    pub async fn start_session(
        &self,
        peer: &PeerAddress,
        bundle: &PreKeyBundle,
    ) -> Result<PreKeyMessage, E2eeError> {
        self.sessions.create_session(peer, bundle).await
    }

    /// Encrypt for `peer` over the pairwise session and seal the result so
    /// the transport cannot see the sender.
    ///
    /// # Errors
    ///
    /// - `NoSession`: no session with `peer`
    /// - `InvalidCertificate`: `certificate` is not for this identity
    pub async fn send_sealed(
        &self,
        peer: &PeerAddress,
        certificate: &SenderCertificate,
        plaintext: &[u8],
    ) -> Result<SealedSenderEnvelope, E2eeError> {
        let recipient = self.sessions.remote_identity(peer).await?.ok_or(E2eeError::NoSession)?;
        let message = self.sessions.encrypt(peer, plaintext).await?;
        let message_type =
            if message.is_pre_key() { MessageType::PreKey } else { MessageType::Ratchet };

        sealed_sender::seal(
            certificate,
            self.identity.identity_key_pair(),
            &recipient,
            &message.to_bytes(),
            message_type,
            &self.env,
        )
    }

    /// Encrypt once for `group_id` and seal a copy for each member.
    ///
    /// Every member needs a session (for its identity key) and our current
    /// sender key.
    pub async fn send_group_sealed(
        &self,
        group_id: &str,
        certificate: &SenderCertificate,
        members: &[PeerAddress],
        plaintext: &[u8],
    ) -> Result<Vec<(PeerAddress, SealedSenderEnvelope)>, E2eeError> {
        let mut recipients = Vec::with_capacity(members.len());
        for member in members {
            let identity =
                self.sessions.remote_identity(member).await?.ok_or(E2eeError::NoSession)?;
            recipients.push((member.clone(), identity));
        }

        let message = self.sender_keys.encrypt_group_message(group_id, plaintext).await?.encode();

        let mut envelopes = Vec::with_capacity(recipients.len());
        for (member, identity) in recipients {
            let envelope = sealed_sender::seal(
                certificate,
                self.identity.identity_key_pair(),
                &identity,
                &message,
                MessageType::SenderKey,
                &self.env,
            )?;
            envelopes.push((member, envelope));
        }
        Ok(envelopes)
    }

    /// Unseal and decrypt an incoming envelope.
    ///
    /// The certificate must be trusted by `verifier`, unexpired, and name the
    /// identity key the pairwise session is bound to.
    ///
    /// # Errors
    ///
    /// - `InvalidCertificate`: untrusted, expired, unparseable device id, or
    ///   identity mismatch with the session
    /// - `NoSession`: a ratchet message from a peer without a session
    /// - any error from the inner session or sender-key decryption
    pub async fn receive_sealed(
        &self,
        envelope: &SealedSenderEnvelope,
        verifier: &CertificateVerifier,
    ) -> Result<Delivery, E2eeError> {
        let unsealed = sealed_sender::unseal(
            envelope,
            self.identity.identity_key_pair(),
            |certificate| verifier.verify(certificate),
            &self.env,
        )?;
        let certificate = &unsealed.certificate;

        let device_id = certificate.sender_device_id.parse::<u32>().map_err(|_| {
            tracing::warn!(device_id = %certificate.sender_device_id, "non-numeric device id");
            E2eeError::InvalidCertificate
        })?;
        let sender = PeerAddress::new(certificate.sender_user_id.clone(), device_id);

        let plaintext = match unsealed.message_type {
            MessageType::PreKey | MessageType::Ratchet => {
                let message = CiphertextMessage::from_bytes(&unsealed.message)?;
                if message.is_pre_key() != (unsealed.message_type == MessageType::PreKey) {
                    tracing::debug!(%sender, "sealed message type does not match payload");
                    return Err(E2eeError::InvalidMessage);
                }

                let bound_identity = match &message {
                    CiphertextMessage::PreKey { pre_key, .. } => Some(pre_key.identity_key),
                    CiphertextMessage::Ratchet(_) => self.sessions.remote_identity(&sender).await?,
                };
                let Some(bound_identity) = bound_identity else {
                    return Err(E2eeError::NoSession);
                };
                if bound_identity != certificate.sender_identity_key {
                    tracing::warn!(%sender, "certificate identity differs from session identity");
                    return Err(E2eeError::InvalidCertificate);
                }

                self.sessions.decrypt(&sender, &message).await?
            },
            MessageType::SenderKey => {
                let message = SenderKeyMessage::decode(&unsealed.message)?;
                self.sender_keys.decrypt_group_message(&sender.user_id, &message).await?
            },
        };

        Ok(Delivery { sender, message_type: unsealed.message_type, plaintext })
    }

    /// Send our sender key for `group_id` to each member over its pairwise
    /// session, creating the key first if needed.
    pub async fn distribute_sender_key(
        &self,
        group_id: &str,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, CiphertextMessage)>, E2eeError> {
        if self.sender_keys.sender_key_id(group_id).await?.is_none() {
            self.sender_keys.create_sender_key(group_id).await?;
        }
        let distribution = self.sender_keys.create_distribution_message(group_id).await?;
        self.send_distribution(&distribution, members).await
    }

    /// Rotate our sender key for `group_id` and send the new one to
    /// `members`.
    pub async fn rotate_sender_key(
        &self,
        group_id: &str,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, CiphertextMessage)>, E2eeError> {
        let distribution = self.sender_keys.rotate_sender_key(group_id).await?;
        self.send_distribution(&distribution, members).await
    }

    /// Drop `removed`'s keys for `group_id`, then rotate our key and send it
    /// to the remaining members so `removed` cannot read later messages.
    pub async fn remove_group_member(
        &self,
        group_id: &str,
        removed: &str,
        remaining: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, CiphertextMessage)>, E2eeError> {
        self.sender_keys.remove_sender_keys_for_member(group_id, removed).await?;
        self.rotate_sender_key(group_id, remaining).await
    }

    async fn send_distribution(
        &self,
        distribution: &SenderKeyDistributionMessage,
        members: &[PeerAddress],
    ) -> Result<Vec<(PeerAddress, CiphertextMessage)>, E2eeError> {
        let payload = distribution.to_bytes()?;

        let mut messages = Vec::with_capacity(members.len());
        for member in members {
            let message = self.sessions.encrypt(member, &payload).await?;
            messages.push((member.clone(), message));
        }

        tracing::debug!(
            group_id = %distribution.group_id,
            key_id = distribution.key_id,
            members = messages.len(),
            "distributed sender key"
        );
        Ok(messages)
    }

    /// Decrypt a sender-key distribution from `sender` and store the key.
    pub async fn receive_sender_key_distribution(
        &self,
        sender: &PeerAddress,
        message: &CiphertextMessage,
    ) -> Result<SenderKeyDistributionMessage, E2eeError> {
        let payload = zeroize::Zeroizing::new(self.sessions.decrypt(sender, message).await?);
        let distribution = SenderKeyDistributionMessage::from_bytes(&payload)?;
        self.sender_keys.process_sender_key_distribution(&sender.user_id, &distribution).await?;
        Ok(distribution)
    }

    /// Periodic upkeep: rotate the signed prekey when due, refill one-time
    /// prekeys once the pool drops below half a batch, and drop idle
    /// sessions.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, E2eeError> {
        let rotated_signed_pre_key = self.prekeys.rotate_if_needed().await?.is_some();

        let remaining = self.prekeys.one_time_pre_key_ids().await?.len();
        let one_time_pre_keys_generated =
            if remaining < (self.config.prekeys.one_time_batch_size / 2) as usize {
                self.prekeys.replenish_one_time_pre_keys().await?.len()
            } else {
                0
            };

        let sessions_removed = self.sessions.cleanup_expired_sessions().await?;

        let report =
            MaintenanceReport {
                rotated_signed_pre_key,
                one_time_pre_keys_generated,
                sessions_removed,
            };
        tracing::debug!(?report, "maintenance complete");
        Ok(report)
    }
}
