//! Sender certificates binding a user/device to an identity key.
//!
//! ```text
//! version:u8 | userIdLen:u16 | userId | deviceIdLen:u16 | deviceId
//! | identityKey:65 | expiresAt:u64 (ms) | sigLen:u16 | signature | serverKeyId:u32
//! ```
//!
//! The signature covers every field except itself, in the same order.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use cinder_crypto::{
    IDENTITY_KEY_SIZE, IdentityKey, SIGNATURE_SIZE, Signature, SigningKeyPair, SigningPublicKey,
};

use crate::{
    E2eeError,
    codec::{Reader, malformed, put_len_u16},
};

/// Current certificate format version.
pub const CERTIFICATE_VERSION: u8 = 1;

/// Authority-signed assertion of a sender's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderCertificate {
    /// Format version
    pub version: u8,
    /// Sender's user id
    pub sender_user_id: String,
    /// Sender's device id
    pub sender_device_id: String,
    /// Sender's long-term identity key
    pub sender_identity_key: IdentityKey,
    /// Expiry (Unix ms)
    pub expires_at: u64,
    /// Authority signature
    pub signature: Signature,
    /// Which authority key signed this certificate
    pub server_key_id: u32,
}

impl SenderCertificate {
    /// Bytes covered by the signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.version);
        put_string(&mut buf, &self.sender_user_id);
        put_string(&mut buf, &self.sender_device_id);
        buf.put_slice(&self.sender_identity_key.encode());
        buf.put_u64(self.expires_at);
        buf.put_u32(self.server_key_id);
        buf.to_vec()
    }

    /// Refuse ids whose length does not fit the `u16` prefix.
    pub(crate) fn check_lengths(&self) -> Result<(), E2eeError> {
        let fits = |value: &str| u16::try_from(value.len()).is_ok();
        if fits(&self.sender_user_id) && fits(&self.sender_device_id) {
            Ok(())
        } else {
            tracing::debug!("certificate id too long for the wire format");
            Err(E2eeError::InvalidMessage)
        }
    }

    /// True once `now` (Unix ms) is past the expiry.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }

    /// Serialize to the binary layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.version);
        put_string(&mut buf, &self.sender_user_id);
        put_string(&mut buf, &self.sender_device_id);
        buf.put_slice(&self.sender_identity_key.encode());
        buf.put_u64(self.expires_at);
        buf.put_u16(SIGNATURE_SIZE as u16);
        buf.put_slice(self.signature.as_bytes());
        buf.put_u32(self.server_key_id);
        buf.freeze()
    }

    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, E2eeError> {
        let version = reader.u8()?;
        if version != CERTIFICATE_VERSION {
            return Err(E2eeError::UnsupportedVersion(version));
        }

        let sender_user_id = get_string(reader)?;
        let sender_device_id = get_string(reader)?;
        let sender_identity_key =
            IdentityKey::decode(reader.bytes(IDENTITY_KEY_SIZE)?).map_err(malformed)?;
        let expires_at = reader.u64()?;
        let signature_len = reader.u16()? as usize;
        let signature = Signature::from_slice(reader.bytes(signature_len)?).map_err(malformed)?;
        let server_key_id = reader.u32()?;

        Ok(Self {
            version,
            sender_user_id,
            sender_device_id,
            sender_identity_key,
            expires_at,
            signature,
            server_key_id,
        })
    }

    /// Parse the binary layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, E2eeError> {
        let mut reader = Reader::new(bytes);
        let certificate = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(certificate)
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_len_u16(&mut *buf, value.len());
    buf.put_slice(value.as_bytes());
}

fn get_string(reader: &mut Reader<'_>) -> Result<String, E2eeError> {
    let len = reader.u16()? as usize;
    let bytes = reader.bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| E2eeError::InvalidMessage)
}

/// Issues sender certificates.
pub struct CertificateAuthority {
    signing_key: SigningKeyPair,
    server_key_id: u32,
}

impl CertificateAuthority {
    /// Authority with the given signing key and key id.
    pub fn new(signing_key: SigningKeyPair, server_key_id: u32) -> Self {
        Self { signing_key, server_key_id }
    }

    /// Verifying key to distribute to recipients.
    pub fn public_key(&self) -> &SigningPublicKey {
        self.signing_key.public_key()
    }

    /// Key id stamped on issued certificates.
    pub fn server_key_id(&self) -> u32 {
        self.server_key_id
    }

    /// Sign a certificate for `user_id`/`device_id` valid until `expires_at`.
    ///
    /// # Errors
    ///
    /// - `InvalidMessage`: an id is longer than `u16::MAX` bytes
    pub fn issue(
        &self,
        user_id: &str,
        device_id: &str,
        identity_key: IdentityKey,
        expires_at: u64,
    ) -> Result<SenderCertificate, E2eeError> {
        let mut certificate = SenderCertificate {
            version: CERTIFICATE_VERSION,
            sender_user_id: user_id.to_string(),
            sender_device_id: device_id.to_string(),
            sender_identity_key: identity_key,
            expires_at,
            signature: Signature::from_bytes([0; SIGNATURE_SIZE]),
            server_key_id: self.server_key_id,
        };
        certificate.check_lengths()?;
        certificate.signature = self.signing_key.sign(&certificate.signed_bytes());
        Ok(certificate)
    }
}

/// Trusted authority keys, by key id.
///
/// Checks signatures only; expiry is enforced by `unseal`.
#[derive(Debug, Clone, Default)]
pub struct CertificateVerifier {
    trusted: HashMap<u32, SigningPublicKey>,
}

impl CertificateVerifier {
    /// Verifier with no trusted keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `key` for certificates stamped with `server_key_id`.
    pub fn trust(&mut self, server_key_id: u32, key: SigningPublicKey) {
        self.trusted.insert(server_key_id, key);
    }

    /// Stop trusting a key id.
    pub fn revoke(&mut self, server_key_id: u32) {
        self.trusted.remove(&server_key_id);
    }

    /// True if a trusted key signed `certificate`.
    pub fn verify(&self, certificate: &SenderCertificate) -> bool {
        let Some(key) = self.trusted.get(&certificate.server_key_id) else {
            tracing::debug!(
                server_key_id = certificate.server_key_id,
                "untrusted certificate key id"
            );
            return false;
        };

        match key.verify(&certificate.signed_bytes(), &certificate.signature) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "certificate signature rejected");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use cinder_crypto::IdentityKeyPair;
    use proptest::prelude::*;

    use super::*;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(SigningKeyPair::from_random([9; 32]), 4)
    }

    fn identity() -> IdentityKey {
        IdentityKeyPair::from_random([1; 32], [2; 32]).public_key()
    }

    #[test]
    fn issued_certificate_verifies() {
        let ca = authority();
        let cert = ca.issue("alice", "1", identity(), 1_000).unwrap();

        let mut verifier = CertificateVerifier::new();
        assert!(!verifier.verify(&cert), "no trusted keys yet");

        verifier.trust(ca.server_key_id(), *ca.public_key());
        assert!(verifier.verify(&cert));

        verifier.revoke(ca.server_key_id());
        assert!(!verifier.verify(&cert));
    }

    #[test]
    fn modified_field_breaks_signature() {
        let ca = authority();
        let mut verifier = CertificateVerifier::new();
        verifier.trust(ca.server_key_id(), *ca.public_key());

        let mut cert = ca.issue("alice", "1", identity(), 1_000).unwrap();
        cert.expires_at += 1;
        assert!(!verifier.verify(&cert));

        let mut cert = ca.issue("alice", "1", identity(), 1_000).unwrap();
        cert.sender_user_id = "mallory".into();
        assert!(!verifier.verify(&cert));
    }

    #[test]
    fn expiry_is_strict() {
        let cert = authority().issue("a", "1", identity(), 1_000).unwrap();
        assert!(!cert.is_expired(1_000));
        assert!(cert.is_expired(1_001));
    }

    #[test]
    fn layout_offsets() {
        let cert = authority().issue("ab", "7", identity(), 5).unwrap();
        let bytes = cert.encode();

        // version + (2 + 2) + (2 + 1) + 65 + 8 + (2 + 64) + 4
        assert_eq!(bytes.len(), 1 + 4 + 3 + 65 + 8 + 66 + 4);
        assert_eq!(bytes[0], CERTIFICATE_VERSION);
        assert_eq!(&bytes[1..3], &2u16.to_be_bytes());
        assert_eq!(&bytes[3..5], b"ab");
    }

    #[test]
    fn rejects_malformed() {
        let bytes = authority().issue("a", "1", identity(), 5).unwrap().encode();
        assert_eq!(
            SenderCertificate::decode(&bytes[..bytes.len() - 2]).unwrap_err(),
            E2eeError::InvalidMessage
        );

        let mut wrong_version = bytes.to_vec();
        wrong_version[0] = 2;
        assert_eq!(
            SenderCertificate::decode(&wrong_version).unwrap_err(),
            E2eeError::UnsupportedVersion(2)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn encode_decode_roundtrip(
            user in "[a-z0-9@.]{0,40}",
            device in "[0-9]{0,6}",
            expires_at in any::<u64>(),
            key_id in any::<u32>(),
        ) {
            let ca = CertificateAuthority::new(SigningKeyPair::from_random([3; 32]), key_id);
            let cert = ca.issue(&user, &device, identity(), expires_at).unwrap();

            let decoded = SenderCertificate::decode(&cert.encode()).unwrap();
            prop_assert_eq!(decoded, cert);
        }
    }
}
