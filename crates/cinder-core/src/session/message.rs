//! Wire format of pairwise session messages.
//!
//! ```text
//! RatchetMessage:    version:u8 | ratchetKey:33 | counter:u32 | previousCounter:u32
//!                    | len:u32 | nonce ‖ ciphertext
//! CiphertextMessage: kind:u8 (1 = PreKey, 2 = Ratchet) | body
//! ```
//!
//! A PreKey body is a `PreKeyMessage` immediately followed by a
//! `RatchetMessage`.

use bytes::{BufMut, Bytes, BytesMut};
use cinder_crypto::{ENCODED_PUBLIC_KEY_SIZE, PublicKey};

use crate::{
    E2eeError,
    codec::{Reader, malformed, put_len_u32},
    x3dh::PreKeyMessage,
};

/// Current `RatchetMessage` wire version.
pub const RATCHET_MESSAGE_VERSION: u8 = 3;

const KIND_PRE_KEY: u8 = 1;
const KIND_RATCHET: u8 = 2;

/// One Double Ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Position in the sender's current chain
    pub counter: u32,
    /// Length of the sender's previous chain
    pub previous_counter: u32,
    /// `nonce ‖ ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Encoded header, also the first part of the AEAD associated data.
    pub(crate) fn header(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + ENCODED_PUBLIC_KEY_SIZE + 8);
        buf.put_u8(RATCHET_MESSAGE_VERSION);
        buf.put_slice(&self.ratchet_key.encode());
        buf.put_u32(self.counter);
        buf.put_u32(self.previous_counter);
        buf.to_vec()
    }

    /// Append the full encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.header());
        put_len_u32(&mut *buf, self.ciphertext.len());
        buf.put_slice(&self.ciphertext);
    }

    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, E2eeError> {
        let version = reader.u8()?;
        if version != RATCHET_MESSAGE_VERSION {
            return Err(E2eeError::UnsupportedVersion(version));
        }

        let ratchet_key =
            PublicKey::decode(reader.bytes(ENCODED_PUBLIC_KEY_SIZE)?).map_err(malformed)?;
        let counter = reader.u32()?;
        let previous_counter = reader.u32()?;
        let len = reader.u32()? as usize;
        let ciphertext = reader.bytes(len)?.to_vec();

        Ok(Self { ratchet_key, counter, previous_counter, ciphertext })
    }
}

/// Outgoing pairwise ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    /// Sent until the initiator has decrypted a reply; lets the responder
    /// build the session
    PreKey {
        /// X3DH header
        pre_key: PreKeyMessage,
        /// Ratchet message encrypted on the new session
        message: RatchetMessage,
    },
    /// Regular message on an established session
    Ratchet(RatchetMessage),
}

impl CiphertextMessage {
    /// The ratchet message inside either variant.
    pub fn ratchet_message(&self) -> &RatchetMessage {
        match self {
            Self::PreKey { message, .. } | Self::Ratchet(message) => message,
        }
    }

    /// True for the PreKey variant.
    pub fn is_pre_key(&self) -> bool {
        matches!(self, Self::PreKey { .. })
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::PreKey { pre_key, message } => {
                buf.put_u8(KIND_PRE_KEY);
                pre_key.encode(&mut buf);
                message.encode(&mut buf);
            },
            Self::Ratchet(message) => {
                buf.put_u8(KIND_RATCHET);
                message.encode(&mut buf);
            },
        }
        buf.freeze()
    }

    /// Parse bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, E2eeError> {
        let mut reader = Reader::new(bytes);
        let message = match reader.u8()? {
            KIND_PRE_KEY => {
                let pre_key = PreKeyMessage::decode_from(&mut reader)?;
                let message = RatchetMessage::decode_from(&mut reader)?;
                Self::PreKey { pre_key, message }
            },
            KIND_RATCHET => Self::Ratchet(RatchetMessage::decode_from(&mut reader)?),
            kind => {
                tracing::debug!(kind, "unknown ciphertext message kind");
                return Err(E2eeError::InvalidMessage);
            },
        };
        reader.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use cinder_crypto::{IdentityKeyPair, KeyPair};

    use super::*;

    fn ratchet_message() -> RatchetMessage {
        RatchetMessage {
            ratchet_key: *KeyPair::from_random([3; 32]).public_key(),
            counter: 5,
            previous_counter: 2,
            ciphertext: vec![0xAB; 40],
        }
    }

    #[test]
    fn ratchet_roundtrip() {
        let message = CiphertextMessage::Ratchet(ratchet_message());
        let bytes = message.to_bytes();

        assert_eq!(bytes[0], KIND_RATCHET);
        assert_eq!(CiphertextMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn pre_key_roundtrip() {
        let identity = IdentityKeyPair::from_random([1; 32], [2; 32]);
        let message = CiphertextMessage::PreKey {
            pre_key: PreKeyMessage {
                registration_id: 12,
                identity_key: identity.public_key(),
                base_key: *KeyPair::from_random([4; 32]).public_key(),
                signed_pre_key_id: 99,
                one_time_pre_key_id: None,
            },
            message: ratchet_message(),
        };

        let decoded = CiphertextMessage::from_bytes(&message.to_bytes()).unwrap();
        assert!(decoded.is_pre_key());
        assert_eq!(decoded, message);
    }

    #[test]
    fn header_layout() {
        let header = ratchet_message().header();
        assert_eq!(header.len(), 1 + 33 + 4 + 4);
        assert_eq!(header[0], RATCHET_MESSAGE_VERSION);
        assert_eq!(&header[34..38], &5u32.to_be_bytes());
    }

    #[test]
    fn rejects_truncated_and_unknown() {
        let bytes = CiphertextMessage::Ratchet(ratchet_message()).to_bytes();

        assert_eq!(
            CiphertextMessage::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err(),
            E2eeError::InvalidMessage
        );

        let mut unknown = bytes.to_vec();
        unknown[0] = 9;
        assert_eq!(CiphertextMessage::from_bytes(&unknown).unwrap_err(), E2eeError::InvalidMessage);

        let mut version = bytes.to_vec();
        version[1] = 1;
        assert_eq!(
            CiphertextMessage::from_bytes(&version).unwrap_err(),
            E2eeError::UnsupportedVersion(1)
        );
    }
}
