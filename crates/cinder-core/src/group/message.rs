//! Sender-key wire messages.
//!
//! ```text
//! SenderKeyMessage: version:u8 | groupIdLen:u16 | groupId | keyId:u32
//!                   | iteration:u32 | len:u32 | nonce ‖ ciphertext | signature:64
//! ```
//!
//! The signature covers `associated_data ‖ nonce ‖ ciphertext`, where the
//! associated data is `groupIdLen | groupId | keyId | iteration`.
//!
//! Distribution messages are CBOR. They carry a chain key and only ever
//! travel inside an established pairwise session.

use bytes::{BufMut, Bytes, BytesMut};
use cinder_crypto::{SIGNATURE_SIZE, Secret, Signature, SigningPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    E2eeError,
    codec::{Reader, malformed, put_len_u16, put_len_u32},
};

/// Current `SenderKeyMessage` wire version.
pub const SENDER_KEY_MESSAGE_VERSION: u8 = 3;

/// One group message, encrypted once for every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyMessage {
    /// Group the message belongs to
    pub group_id: String,
    /// Sender key generation
    pub key_id: u32,
    /// Position in the sender's chain
    pub iteration: u32,
    /// `nonce ‖ ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
    /// Sender's signature over the associated data and ciphertext
    pub signature: Signature,
}

impl SenderKeyMessage {
    /// `groupIdLen:u16 | groupId | keyId:u32 | iteration:u32`
    pub(crate) fn associated_data(group_id: &str, key_id: u32, iteration: u32) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(2 + group_id.len() + 8);
        put_len_u16(&mut buf, group_id.len());
        buf.put_slice(group_id.as_bytes());
        buf.put_u32(key_id);
        buf.put_u32(iteration);
        buf.to_vec()
    }

    /// Bytes covered by the signature.
    pub(crate) fn signed_bytes(
        group_id: &str,
        key_id: u32,
        iteration: u32,
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let mut bytes = Self::associated_data(group_id, key_id, iteration);
        bytes.extend_from_slice(ciphertext);
        bytes
    }

    /// Check the signature with the sender's distributed signing key.
    pub fn verify(&self, signing_key: &SigningPublicKey) -> Result<(), E2eeError> {
        let signed =
            Self::signed_bytes(&self.group_id, self.key_id, self.iteration, &self.ciphertext);
        signing_key.verify(&signed, &self.signature).map_err(|err| {
            tracing::debug!(
                error = %err,
                group_id = %self.group_id,
                "sender key signature rejected"
            );
            E2eeError::InvalidSignature
        })
    }

    /// Serialize to the binary layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            1 + 2 + self.group_id.len() + 12 + self.ciphertext.len() + SIGNATURE_SIZE,
        );
        buf.put_u8(SENDER_KEY_MESSAGE_VERSION);
        buf.put_slice(&Self::associated_data(&self.group_id, self.key_id, self.iteration));
        put_len_u32(&mut buf, self.ciphertext.len());
        buf.put_slice(&self.ciphertext);
        buf.put_slice(self.signature.as_bytes());
        buf.freeze()
    }

    /// Parse the binary layout.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion`: unknown version byte
    /// - `InvalidMessage`: truncated, trailing bytes, or non-UTF-8 group id
    pub fn decode(bytes: &[u8]) -> Result<Self, E2eeError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8()?;
        if version != SENDER_KEY_MESSAGE_VERSION {
            return Err(E2eeError::UnsupportedVersion(version));
        }

        let group_id_len = reader.u16()? as usize;
        let group_id = String::from_utf8(reader.bytes(group_id_len)?.to_vec())
            .map_err(|_| E2eeError::InvalidMessage)?;
        let key_id = reader.u32()?;
        let iteration = reader.u32()?;
        let len = reader.u32()? as usize;
        let ciphertext = reader.bytes(len)?.to_vec();
        let signature = Signature::from_slice(reader.bytes(SIGNATURE_SIZE)?).map_err(malformed)?;
        reader.finish()?;

        Ok(Self { group_id, key_id, iteration, ciphertext, signature })
    }
}

/// Everything a member needs to decrypt one sender's group messages from
/// `iteration` onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    /// Group id
    pub group_id: String,
    /// Sender key generation
    pub key_id: u32,
    /// First iteration the recipient can decrypt
    pub iteration: u32,
    /// Chain key at `iteration`
    pub chain_key: Secret<32>,
    /// Verifying half of the sender's signing key
    pub signing_key: SigningPublicKey,
    /// Sender's user id
    pub sender_id: String,
}

impl SenderKeyDistributionMessage {
    /// CBOR encoding, for transport inside a pairwise session.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, E2eeError> {
        let mut buf = Zeroizing::new(Vec::new());
        ciborium::into_writer(self, &mut *buf).map_err(|err| {
            tracing::debug!(error = %err, "distribution message encoding failed");
            E2eeError::InvalidMessage
        })?;
        Ok(buf)
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, E2eeError> {
        ciborium::from_reader(bytes).map_err(|err| {
            tracing::debug!(error = %err, "malformed distribution message");
            E2eeError::InvalidMessage
        })
    }
}
