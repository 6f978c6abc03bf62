//! Persisted sender-key records.

use cinder_crypto::{SigningKeyPair, SigningPublicKey, SymmetricRatchet};
use serde::{Deserialize, Serialize};

/// Our own sender key for one group.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SenderKeyState {
    pub(crate) group_id: String,
    pub(crate) key_id: u32,
    /// Counter is the iteration of the next outgoing message
    pub(crate) chain: SymmetricRatchet,
    pub(crate) signing_key: SigningKeyPair,
    pub(crate) created_at: u64,
}

/// Another member's sender key, keyed by `(group, sender, key_id)`.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ReceivedSenderKey {
    pub(crate) group_id: String,
    pub(crate) sender_id: String,
    pub(crate) key_id: u32,
    /// Counter is the lowest iteration still decryptable
    pub(crate) chain: SymmetricRatchet,
    pub(crate) signing_key: SigningPublicKey,
    pub(crate) received_at: u64,
}

pub(crate) fn outgoing_key(group_id: &str) -> String {
    hex::encode(group_id.as_bytes())
}

/// Prefix shared by every received key of a group.
pub(crate) fn group_prefix(group_id: &str) -> String {
    format!("{}:", hex::encode(group_id.as_bytes()))
}

/// Prefix shared by every received key of one member in a group.
pub(crate) fn member_prefix(group_id: &str, sender_id: &str) -> String {
    format!("{}{}:", group_prefix(group_id), hex::encode(sender_id.as_bytes()))
}

pub(crate) fn incoming_key(group_id: &str, sender_id: &str, key_id: u32) -> String {
    format!("{}{key_id}", member_prefix(group_id, sender_id))
}
