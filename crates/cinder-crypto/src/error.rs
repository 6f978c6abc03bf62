//! Error types for primitive operations

use thiserror::Error;

/// Errors from the cryptographic primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes are malformed or produce a non-contributory shared
    /// secret (low-order point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the given key and message
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD open failed (authentication tag mismatch or truncated input)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: &'static str,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Ratchet counter would overflow
    #[error("ratchet counter overflow at {current}")]
    CounterOverflow {
        /// Current counter when overflow was detected
        current: u32,
    },

    /// Requested counter is outside the window the ratchet may advance over
    #[error("ratchet cannot reach {requested} from {current}")]
    CounterOutOfRange {
        /// Current ratchet counter
        current: u32,
        /// Requested counter
        requested: u32,
    },
}

impl CryptoError {
    /// Returns true if this error means the input was forged or corrupted.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::DecryptionFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures() {
        assert!(CryptoError::InvalidSignature.is_authentication_failure());
        assert!(CryptoError::DecryptionFailed { reason: "tag" }.is_authentication_failure());
        assert!(!CryptoError::InvalidPublicKey.is_authentication_failure());
        assert!(!CryptoError::CounterOverflow { current: 1 }.is_authentication_failure());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::CounterOutOfRange { current: 10, requested: 3 };
        assert_eq!(err.to_string(), "ratchet cannot reach 3 from 10");
    }
}
