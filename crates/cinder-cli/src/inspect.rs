//! Human-readable dumps of wire structures.
//!
//! Nothing here decrypts: an envelope only reveals its header, and a
//! certificate is checked against an authority key only when one is given.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use cinder_core::{CertificateVerifier, SealedSenderEnvelope, SenderCertificate};
use cinder_crypto::{SigningPublicKey, keys::PUBLIC_KEY_SIZE};

use crate::CliError;

/// Text encoding of a binary argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Encoding {
    /// Standard base64 with padding
    #[default]
    Base64,
    /// Lowercase or uppercase hex
    Hex,
}

impl Encoding {
    /// Decode `input`, ignoring surrounding whitespace.
    pub fn decode(self, input: &str) -> Result<Vec<u8>, CliError> {
        let input = input.trim();
        match self {
            Self::Base64 => STANDARD.decode(input).map_err(|e| CliError::Encoding(e.to_string())),
            Self::Hex => hex::decode(input).map_err(|e| CliError::Encoding(e.to_string())),
        }
    }
}

/// Parse a hex Ed25519 authority key.
pub fn parse_signing_key(input: &str) -> Result<SigningPublicKey, CliError> {
    let bytes = Encoding::Hex.decode(input)?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        CliError::Encoding(format!(
            "authority key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningPublicKey::from_bytes(bytes))
}

/// Header of a sealed-sender envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeReport {
    /// Format version
    pub version: u8,
    /// Ephemeral key, hex of its 33-byte encoding
    pub ephemeral_key: String,
    /// Length of `nonce ‖ ciphertext ‖ tag`
    pub content_len: usize,
    /// Length of the whole binary envelope
    pub total_len: usize,
}

impl fmt::Display for EnvelopeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sealed sender envelope")?;
        writeln!(f, "  version        {}", self.version)?;
        writeln!(f, "  ephemeral key  {}", self.ephemeral_key)?;
        writeln!(f, "  content        {} bytes", self.content_len)?;
        write!(f, "  total          {} bytes", self.total_len)
    }
}

/// Decode an envelope and describe its header.
pub fn inspect_envelope(input: &str, encoding: Encoding) -> Result<EnvelopeReport, CliError> {
    let bytes = encoding.decode(input)?;
    let envelope = SealedSenderEnvelope::decode(&bytes)?;

    Ok(EnvelopeReport {
        version: envelope.version,
        ephemeral_key: hex::encode(envelope.ephemeral_key.encode()),
        content_len: envelope.encrypted_content.len(),
        total_len: bytes.len(),
    })
}

/// Result of checking a certificate signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// No authority key was supplied
    Unchecked,
    /// Signed by the supplied authority key
    Valid,
    /// Not signed by the supplied authority key, or a different key id
    Invalid,
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unchecked => "unchecked",
            Self::Valid => "valid",
            Self::Invalid => "INVALID",
        })
    }
}

/// Decoded sender certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateReport {
    /// Sender user id
    pub sender_user_id: String,
    /// Sender device id
    pub sender_device_id: String,
    /// Identity key, hex of its 65-byte encoding
    pub identity_key: String,
    /// Expiry (Unix ms)
    pub expires_at: u64,
    /// Expired relative to the inspection time
    pub expired: bool,
    /// Authority key id
    pub server_key_id: u32,
    /// Signature check outcome
    pub signature: SignatureStatus,
}

impl fmt::Display for CertificateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sender certificate")?;
        writeln!(f, "  sender         {}.{}", self.sender_user_id, self.sender_device_id)?;
        writeln!(f, "  identity key   {}", self.identity_key)?;
        writeln!(
            f,
            "  expires at     {} ms ({})",
            self.expires_at,
            if self.expired { "expired" } else { "valid" }
        )?;
        writeln!(f, "  server key id  {}", self.server_key_id)?;
        write!(f, "  signature      {}", self.signature)
    }
}

/// Decode a certificate, check expiry against `now` and, when `authority`
/// is given, its signature.
pub fn inspect_certificate(
    input: &str,
    encoding: Encoding,
    now: u64,
    authority: Option<(u32, SigningPublicKey)>,
) -> Result<CertificateReport, CliError> {
    let bytes = encoding.decode(input)?;
    let certificate = SenderCertificate::decode(&bytes)?;

    let signature = match authority {
        None => SignatureStatus::Unchecked,
        Some((key_id, key)) => {
            let mut verifier = CertificateVerifier::new();
            verifier.trust(key_id, key);
            if verifier.verify(&certificate) {
                SignatureStatus::Valid
            } else {
                SignatureStatus::Invalid
            }
        },
    };

    Ok(CertificateReport {
        sender_user_id: certificate.sender_user_id.clone(),
        sender_device_id: certificate.sender_device_id.clone(),
        identity_key: hex::encode(certificate.sender_identity_key.encode()),
        expires_at: certificate.expires_at,
        expired: certificate.is_expired(now),
        server_key_id: certificate.server_key_id,
        signature,
    })
}
