//! Sealed sender: hide the sender's identity from the transport.
//!
//! The sender's certificate and the inner message are encrypted to the
//! recipient's identity DH key under a fresh ephemeral key. Only the
//! recipient learns who sent it.
//!
//! ```text
//! shared = ECDH(ephemeral, recipient.identity.dh)
//! key    = HKDF(salt = ephemeral (33 bytes), ikm = shared,
//!               info = "CinderSealedSenderV1", 32)
//! aad    = version ‖ ephemeral (33 bytes)
//!
//! content = certLen:u16 | certificate | type:u8 | msgLen:u32 | message
//! ```

mod certificate;
mod envelope;

use bytes::BufMut;
use cinder_crypto::{IdentityKey, IdentityKeyPair, KeyPair, PublicKey, Secret, aead, kdf};
use zeroize::Zeroizing;

pub use self::{
    certificate::{
        CERTIFICATE_VERSION, CertificateAuthority, CertificateVerifier, SenderCertificate,
    },
    envelope::{SEALED_SENDER_VERSION, SealedSenderEnvelope},
};
use crate::{
    E2eeError,
    codec::{Reader, put_len_u16, put_len_u32},
    env::Environment,
};

/// Kind of message carried inside an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Session-establishing `CiphertextMessage::PreKey`
    PreKey = 1,
    /// `CiphertextMessage::Ratchet`
    Ratchet = 2,
    /// Group sender-key message
    SenderKey = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = E2eeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::PreKey),
            2 => Ok(Self::Ratchet),
            3 => Ok(Self::SenderKey),
            other => {
                tracing::debug!(message_type = other, "unknown sealed message type");
                Err(E2eeError::InvalidMessage)
            },
        }
    }
}

/// Decrypted envelope contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealedMessage {
    /// Verified, unexpired sender certificate
    pub certificate: SenderCertificate,
    /// Kind of the inner message
    pub message_type: MessageType,
    /// Inner message bytes
    pub message: Vec<u8>,
}

/// Encrypt `message` to `recipient`, attaching `certificate`.
///
/// # Errors
///
/// - `InvalidCertificate`: `certificate` does not name `sender_identity`
/// - `DecryptionFailed`: `recipient` has a low-order DH key
/// - `InvalidMessage`: content too large for the length prefixes
pub fn seal<E: Environment>(
    certificate: &SenderCertificate,
    sender_identity: &IdentityKeyPair,
    recipient: &IdentityKey,
    message: &[u8],
    message_type: MessageType,
    env: &E,
) -> Result<SealedSenderEnvelope, E2eeError> {
    if certificate.sender_identity_key != sender_identity.public_key() {
        tracing::warn!(
            sender = %certificate.sender_user_id,
            "certificate identity does not match sender identity"
        );
        return Err(E2eeError::InvalidCertificate);
    }

    certificate.check_lengths()?;
    let encoded_certificate = certificate.encode();
    let content_len = 2 + encoded_certificate.len() + 1 + 4 + message.len();
    let sealed_len = aead::NONCE_SIZE + content_len + aead::TAG_SIZE;
    if u16::try_from(encoded_certificate.len()).is_err() || u32::try_from(sealed_len).is_err() {
        tracing::debug!(len = sealed_len, "sealed content too large for the wire format");
        return Err(E2eeError::InvalidMessage);
    }

    let mut content = Zeroizing::new(Vec::with_capacity(content_len));
    put_len_u16(&mut *content, encoded_certificate.len());
    content.put_slice(&encoded_certificate);
    content.put_u8(message_type as u8);
    put_len_u32(&mut *content, message.len());
    content.put_slice(message);

    let ephemeral = KeyPair::from_random(env.random_array());
    let shared = ephemeral.diffie_hellman(recipient.dh_key())?;
    let key = envelope_key(&shared, ephemeral.public_key());

    let mut envelope = SealedSenderEnvelope {
        version: SEALED_SENDER_VERSION,
        ephemeral_key: *ephemeral.public_key(),
        encrypted_content: Vec::new(),
    };
    envelope.encrypted_content =
        aead::encrypt(&key, env.random_array(), &content, &envelope.associated_data());

    tracing::debug!(
        message_type = ?message_type,
        len = envelope.encrypted_content.len(),
        "sealed message"
    );
    Ok(envelope)
}

/// Decrypt an envelope addressed to `recipient`.
///
/// `verify_certificate` decides whether the certificate was issued by a
/// trusted authority. Expiry is checked here against `env`'s clock.
///
/// # Errors
///
/// - `UnsupportedVersion`: unknown envelope version
/// - `DecryptionFailed`: wrong recipient or tampered envelope
/// - `InvalidMessage`: decrypted content is malformed
/// - `InvalidCertificate`: rejected by `verify_certificate`, or expired
pub fn unseal<E, F>(
    envelope: &SealedSenderEnvelope,
    recipient: &IdentityKeyPair,
    verify_certificate: F,
    env: &E,
) -> Result<UnsealedMessage, E2eeError>
where
    E: Environment,
    F: FnOnce(&SenderCertificate) -> bool,
{
    if envelope.version != SEALED_SENDER_VERSION {
        return Err(E2eeError::UnsupportedVersion(envelope.version));
    }

    let shared = recipient.dh_key_pair().diffie_hellman(&envelope.ephemeral_key)?;
    let key = envelope_key(&shared, &envelope.ephemeral_key);
    let content = Zeroizing::new(
        aead::decrypt(&key, &envelope.encrypted_content, &envelope.associated_data()).map_err(
            |err| {
                tracing::debug!(error = %err, "sealed envelope rejected");
                E2eeError::DecryptionFailed
            },
        )?,
    );

    let mut reader = Reader::new(&content);
    let certificate_len = reader.u16()? as usize;
    let certificate = SenderCertificate::decode(reader.bytes(certificate_len)?)?;
    let message_type = MessageType::try_from(reader.u8()?)?;
    let message_len = reader.u32()? as usize;
    let message = reader.bytes(message_len)?.to_vec();
    reader.finish()?;

    if !verify_certificate(&certificate) {
        tracing::warn!(sender = %certificate.sender_user_id, "certificate not trusted");
        return Err(E2eeError::InvalidCertificate);
    }

    let now = env.now_millis();
    if certificate.is_expired(now) {
        tracing::warn!(
            sender = %certificate.sender_user_id,
            expires_at = certificate.expires_at,
            now,
            "certificate expired"
        );
        return Err(E2eeError::InvalidCertificate);
    }

    Ok(UnsealedMessage { certificate, message_type, message })
}

fn envelope_key(shared: &Secret<32>, ephemeral: &PublicKey) -> Secret<32> {
    kdf::hkdf(Some(&ephemeral.encode()), shared.as_bytes(), kdf::SEALED_SENDER_LABEL)
}

#[cfg(test)]
mod tests {
    use cinder_crypto::SigningKeyPair;
    use proptest::prelude::*;

    use super::*;
    use crate::env::test_env::TestEnv;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    struct Fixture {
        env: TestEnv,
        authority: CertificateAuthority,
        verifier: CertificateVerifier,
        alice: IdentityKeyPair,
        bob: IdentityKeyPair,
    }

    fn fixture(seed: u64) -> Fixture {
        let env = TestEnv::new(seed);
        let signing_key = SigningKeyPair::from_random(env.random_array());
        let authority = CertificateAuthority::new(signing_key, 1);
        let mut verifier = CertificateVerifier::new();
        verifier.trust(authority.server_key_id(), *authority.public_key());
        let alice = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let bob = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        Fixture { env, authority, verifier, alice, bob }
    }

    impl Fixture {
        fn certificate(&self) -> SenderCertificate {
            self.authority
                .issue("alice", "1", self.alice.public_key(), self.env.now_millis() + HOUR_MS)
                .unwrap()
        }

        fn seal(&self, message: &[u8]) -> SealedSenderEnvelope {
            seal(
                &self.certificate(),
                &self.alice,
                &self.bob.public_key(),
                message,
                MessageType::Ratchet,
                &self.env,
            )
            .unwrap()
        }
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let f = fixture(1);
        let envelope = f.seal(b"hello bob");

        let wire = SealedSenderEnvelope::from_base64(&envelope.to_base64()).unwrap();
        let opened = unseal(&wire, &f.bob, |c| f.verifier.verify(c), &f.env).unwrap();

        assert_eq!(opened.message, b"hello bob");
        assert_eq!(opened.message_type, MessageType::Ratchet);
        assert_eq!(opened.certificate.sender_user_id, "alice");
        assert_eq!(opened.certificate.sender_identity_key, f.alice.public_key());
    }

    #[test]
    fn ephemeral_key_is_fresh_per_envelope() {
        let f = fixture(2);
        let first = f.seal(b"same");
        let second = f.seal(b"same");
        assert_ne!(first.ephemeral_key, second.ephemeral_key);
        assert_ne!(first.encrypted_content, second.encrypted_content);
    }

    #[test]
    fn wrong_recipient_fails_decryption() {
        let f = fixture(3);
        let envelope = f.seal(b"for bob");
        let result = unseal(&envelope, &f.alice, |_| true, &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::DecryptionFailed);
    }

    #[test]
    fn rejected_certificate() {
        let f = fixture(4);
        let envelope = f.seal(b"hi");
        let result = unseal(&envelope, &f.bob, |_| false, &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::InvalidCertificate);
    }

    #[test]
    fn ids_longer_than_length_prefix_are_refused() {
        let f = fixture(9);
        let long_id = "a".repeat(usize::from(u16::MAX) + 1);

        assert_eq!(
            f.authority.issue(&long_id, "1", f.alice.public_key(), u64::MAX).unwrap_err(),
            E2eeError::InvalidMessage
        );

        let mut certificate = f.certificate();
        certificate.sender_device_id = long_id;
        let result = seal(
            &certificate,
            &f.alice,
            &f.bob.public_key(),
            b"hi",
            MessageType::Ratchet,
            &f.env,
        );
        assert_eq!(result.unwrap_err(), E2eeError::InvalidMessage);
    }

    #[test]
    fn untrusted_authority() {
        let f = fixture(5);
        let rogue = CertificateAuthority::new(SigningKeyPair::from_random([0x42; 32]), 1);
        let certificate = rogue.issue("alice", "1", f.alice.public_key(), u64::MAX).unwrap();
        let envelope = seal(
            &certificate,
            &f.alice,
            &f.bob.public_key(),
            b"hi",
            MessageType::PreKey,
            &f.env,
        )
        .unwrap();

        let result = unseal(&envelope, &f.bob, |c| f.verifier.verify(c), &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::InvalidCertificate);
    }

    #[test]
    fn expired_certificate() {
        let f = fixture(6);
        let envelope = f.seal(b"late");

        f.env.advance_millis(HOUR_MS);
        assert!(unseal(&envelope, &f.bob, |c| f.verifier.verify(c), &f.env).is_ok());

        f.env.advance_millis(1);
        let result = unseal(&envelope, &f.bob, |c| f.verifier.verify(c), &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::InvalidCertificate);
    }

    #[test]
    fn certificate_for_other_identity_cannot_seal() {
        let f = fixture(7);
        let result = seal(
            &f.certificate(),
            &f.bob,
            &f.alice.public_key(),
            b"spoof",
            MessageType::Ratchet,
            &f.env,
        );
        assert_eq!(result.unwrap_err(), E2eeError::InvalidCertificate);
    }

    #[test]
    fn unknown_version_rejected_before_decryption() {
        let f = fixture(8);
        let mut envelope = f.seal(b"x");
        envelope.version = 2;
        let result = unseal(&envelope, &f.bob, |_| true, &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::UnsupportedVersion(2));
    }

    #[test]
    fn tampered_header_fails_decryption() {
        let f = fixture(9);
        let mut envelope = f.seal(b"x");
        envelope.ephemeral_key = *KeyPair::from_random([7; 32]).public_key();
        let result = unseal(&envelope, &f.bob, |_| true, &f.env);
        assert_eq!(result.unwrap_err(), E2eeError::DecryptionFailed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_payload_survives_sealing(
            message in proptest::collection::vec(any::<u8>(), 0..512),
            kind in 1u8..=3,
        ) {
            let f = fixture(10);
            let message_type = MessageType::try_from(kind).unwrap();
            let envelope = seal(
                &f.certificate(),
                &f.alice,
                &f.bob.public_key(),
                &message,
                message_type,
                &f.env,
            )
            .unwrap();

            let opened = unseal(&envelope, &f.bob, |c| f.verifier.verify(c), &f.env).unwrap();
            prop_assert_eq!(opened.message, message);
            prop_assert_eq!(opened.message_type, message_type);
        }
    }
}
