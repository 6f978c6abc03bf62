//! Outer sealed-sender envelope.
//!
//! ```text
//! version:u8 | ephemeralKeyLen:u8 (33) | ephemeralKey | contentLen:u32 | content
//! ```
//!
//! `content` is `nonce ‖ ciphertext ‖ tag`. Transport is usually base64.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use cinder_crypto::{ENCODED_PUBLIC_KEY_SIZE, PublicKey};

use crate::{
    E2eeError,
    codec::{Reader, malformed, put_len_u32},
};

/// Current envelope version.
pub const SEALED_SENDER_VERSION: u8 = 1;

/// Encrypted envelope hiding the sender from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSenderEnvelope {
    /// Format version
    pub version: u8,
    /// Single-use sender ephemeral key
    pub ephemeral_key: PublicKey,
    /// `nonce ‖ ciphertext ‖ tag` over the serialized content
    pub encrypted_content: Vec<u8>,
}

impl SealedSenderEnvelope {
    /// Serialize to the binary layout.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(2 + ENCODED_PUBLIC_KEY_SIZE + 4 + self.encrypted_content.len());
        buf.put_u8(self.version);
        buf.put_u8(ENCODED_PUBLIC_KEY_SIZE as u8);
        buf.put_slice(&self.ephemeral_key.encode());
        put_len_u32(&mut buf, self.encrypted_content.len());
        buf.put_slice(&self.encrypted_content);
        buf.freeze()
    }

    /// Parse the binary layout.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion`: unknown version byte
    /// - `InvalidMessage`: truncated, trailing bytes, or bad key encoding
    pub fn decode(bytes: &[u8]) -> Result<Self, E2eeError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8()?;
        if version != SEALED_SENDER_VERSION {
            return Err(E2eeError::UnsupportedVersion(version));
        }

        let key_len = reader.u8()? as usize;
        if key_len != ENCODED_PUBLIC_KEY_SIZE {
            tracing::debug!(key_len, "unexpected ephemeral key length");
            return Err(E2eeError::InvalidMessage);
        }
        let ephemeral_key = PublicKey::decode(reader.bytes(key_len)?).map_err(malformed)?;

        let content_len = reader.u32()? as usize;
        let encrypted_content = reader.bytes(content_len)?.to_vec();
        reader.finish()?;

        Ok(Self { version, ephemeral_key, encrypted_content })
    }

    /// Standard base64 of [`Self::encode`].
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    /// Inverse of [`Self::to_base64`].
    ///
    /// # Errors
    ///
    /// - `InvalidMessage`: not valid base64, or the decoded bytes are malformed
    /// - `UnsupportedVersion`: unknown version byte
    pub fn from_base64(encoded: &str) -> Result<Self, E2eeError> {
        let bytes = STANDARD.decode(encoded).map_err(|err| {
            tracing::debug!(error = %err, "envelope is not valid base64");
            E2eeError::InvalidMessage
        })?;
        Self::decode(&bytes)
    }

    /// Associated data binding the header to the ciphertext.
    pub(crate) fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(1 + ENCODED_PUBLIC_KEY_SIZE);
        aad.push(self.version);
        aad.extend_from_slice(&self.ephemeral_key.encode());
        aad
    }
}
