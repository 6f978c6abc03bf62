//! Error taxonomy for the encryption core.
//!
//! Display strings are deliberately generic: they cross the trust boundary
//! and must not tell a peer *why* a message was rejected. Diagnostic detail
//! goes to `tracing` at the point of failure.

use cinder_crypto::CryptoError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by the encryption core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum E2eeError {
    /// Referenced signed prekey, one-time prekey, sender key or identity is
    /// missing
    #[error("key not found")]
    KeyNotFound,

    /// Signature did not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD decryption or key agreement failed
    #[error("decryption failed")]
    DecryptionFailed,

    /// Counter or iteration already consumed (replay)
    #[error("duplicate message")]
    DuplicateMessage,

    /// Counter or iteration too far ahead of local state
    #[error("message outside the accepted window")]
    OutdatedMessage,

    /// Storage backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire format version is not supported
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// No session with the peer
    #[error("no session")]
    NoSession,

    /// Wire data is structurally malformed
    #[error("invalid message")]
    InvalidMessage,

    /// Sender certificate was rejected by the verifier or has expired
    #[error("invalid certificate")]
    InvalidCertificate,
}

impl E2eeError {
    /// Stable taxonomy code, suitable for metrics and client error surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::DuplicateMessage => "DUPLICATE_MESSAGE",
            Self::OutdatedMessage => "OUTDATED_MESSAGE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            Self::NoSession => "NO_SESSION",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidCertificate => "INVALID_CERTIFICATE",
        }
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// Only storage failures are transient. Every cryptographic rejection is
    /// final for that message.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<CryptoError> for E2eeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => Self::InvalidSignature,
            CryptoError::DecryptionFailed { .. } | CryptoError::InvalidPublicKey => {
                Self::DecryptionFailed
            },
            CryptoError::InvalidKeyLength { .. } => Self::InvalidMessage,
            CryptoError::CounterOverflow { .. } | CryptoError::CounterOutOfRange { .. } => {
                Self::OutdatedMessage
            },
        }
    }
}
