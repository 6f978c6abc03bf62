//! Per-peer Double Ratchet state.

use std::collections::VecDeque;

use cinder_crypto::{IdentityKey, KeyPair, PublicKey, Secret};
use serde::{Deserialize, Serialize};

use crate::x3dh::{InitialKeys, PreKeyMessage};

/// Number of retired receiving ratchet keys remembered for replay
/// classification.
pub(super) const RETIRED_RATCHET_KEYS: usize = 8;

/// Number of superseded handshakes remembered per peer.
pub(super) const PREVIOUS_BASE_KEYS: usize = 40;

/// Cached key for a message that has not arrived yet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct SkippedMessageKey {
    pub(super) ratchet_key: PublicKey,
    pub(super) counter: u32,
    pub(super) message_key: Secret<32>,
}

/// First-contact header the initiator repeats until the peer replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct PendingPreKey {
    pub(super) registration_id: u32,
    pub(super) signed_pre_key_id: u32,
    pub(super) one_time_pre_key_id: Option<u32>,
}

/// Double Ratchet state for one remote device.
///
/// # Invariants
///
/// - Right after creation exactly one chain key is set: the sending chain for
///   the initiator, the receiving chain for the responder
/// - `skipped_message_keys.len() <= max_skipped_message_keys`; each entry is
///   removed when used
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub(super) local_identity_key: IdentityKey,
    pub(super) remote_identity_key: IdentityKey,
    pub(super) root_key: Secret<32>,
    pub(super) sending_chain_key: Option<Secret<32>>,
    pub(super) receiving_chain_key: Option<Secret<32>>,
    pub(super) sending_ratchet_key: Option<KeyPair>,
    pub(super) receiving_ratchet_key: Option<PublicKey>,
    pub(super) sending_message_number: u32,
    pub(super) receiving_message_number: u32,
    pub(super) previous_chain_length: u32,
    pub(super) skipped_message_keys: VecDeque<SkippedMessageKey>,
    pub(super) retired_ratchet_keys: VecDeque<PublicKey>,
    /// X3DH ephemeral key identifying the handshake this session came from
    pub(super) base_key: PublicKey,
    /// Base keys of the sessions this one replaced, newest last
    #[serde(default)]
    pub(super) previous_base_keys: VecDeque<PublicKey>,
    pub(super) pending_pre_key: Option<PendingPreKey>,
    pub(super) created_at: u64,
    pub(super) last_activity_at: u64,
}

impl SessionState {
    /// Session as seen by the X3DH initiator.
    ///
    /// The X3DH ephemeral key doubles as the first sending ratchet key.
    pub(crate) fn initiator(
        local_identity_key: IdentityKey,
        initial_message: &PreKeyMessage,
        remote_identity_key: IdentityKey,
        keys: InitialKeys,
        ephemeral: KeyPair,
        now: u64,
    ) -> Self {
        Self {
            local_identity_key,
            remote_identity_key,
            root_key: keys.root_key,
            sending_chain_key: Some(keys.chain_key),
            receiving_chain_key: None,
            base_key: *ephemeral.public_key(),
            sending_ratchet_key: Some(ephemeral),
            receiving_ratchet_key: None,
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
            previous_base_keys: VecDeque::new(),
            pending_pre_key: Some(PendingPreKey {
                registration_id: initial_message.registration_id,
                signed_pre_key_id: initial_message.signed_pre_key_id,
                one_time_pre_key_id: initial_message.one_time_pre_key_id,
            }),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Session as seen by the X3DH responder.
    ///
    /// The initiator's base key is the first receiving ratchet key.
    pub(crate) fn responder(
        local_identity_key: IdentityKey,
        remote_identity_key: IdentityKey,
        base_key: PublicKey,
        keys: InitialKeys,
        now: u64,
    ) -> Self {
        Self {
            local_identity_key,
            remote_identity_key,
            root_key: keys.root_key,
            sending_chain_key: None,
            receiving_chain_key: Some(keys.chain_key),
            sending_ratchet_key: None,
            receiving_ratchet_key: Some(base_key),
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            retired_ratchet_keys: VecDeque::new(),
            base_key,
            previous_base_keys: VecDeque::new(),
            pending_pre_key: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Take over the handshake history of the session this one replaces.
    pub(super) fn supersede(&mut self, previous: &SessionState) {
        let mut history = previous.previous_base_keys.clone();
        history.push_back(previous.base_key);
        while history.len() > PREVIOUS_BASE_KEYS {
            history.pop_front();
        }
        self.previous_base_keys = history;
    }

    /// True if `base_key` belongs to a handshake this session replaced.
    pub(super) fn is_superseded_handshake(&self, base_key: &PublicKey) -> bool {
        self.previous_base_keys.contains(base_key)
    }

    /// Peer's long-term identity key.
    pub fn remote_identity_key(&self) -> &IdentityKey {
        &self.remote_identity_key
    }

    /// X3DH base key of the handshake that created this session.
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    /// Creation time (Unix ms).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the last successful encrypt or decrypt (Unix ms).
    pub fn last_activity_at(&self) -> u64 {
        self.last_activity_at
    }

    /// Key-free view of this state.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            remote_identity_key: self.remote_identity_key,
            has_sending_chain: self.sending_chain_key.is_some(),
            has_receiving_chain: self.receiving_chain_key.is_some(),
            sending_message_number: self.sending_message_number,
            receiving_message_number: self.receiving_message_number,
            previous_chain_length: self.previous_chain_length,
            skipped_message_keys: self.skipped_message_keys.len(),
            awaiting_reply: self.pending_pre_key.is_some(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Introspection view of a session. Never contains key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Peer's long-term identity key
    pub remote_identity_key: IdentityKey,
    /// A sending chain key is present
    pub has_sending_chain: bool,
    /// A receiving chain key is present
    pub has_receiving_chain: bool,
    /// Next counter on the sending chain
    pub sending_message_number: u32,
    /// Next expected counter on the receiving chain
    pub receiving_message_number: u32,
    /// Length of the previous sending chain
    pub previous_chain_length: u32,
    /// Cached keys for messages not yet received
    pub skipped_message_keys: usize,
    /// Outgoing messages still carry the X3DH header
    pub awaiting_reply: bool,
    /// Creation time (Unix ms)
    pub created_at: u64,
    /// Last activity (Unix ms)
    pub last_activity_at: u64,
}
