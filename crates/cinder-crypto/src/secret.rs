//! Zero-on-drop container for key material.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fixed-size secret bytes.
///
/// Memory is zeroed when the value is dropped, equality is constant-time and
/// `Debug` never prints the contents. Every private key, chain key, root key
/// and derived message key in this workspace lives in one of these.
#[derive(Clone, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    /// Take ownership of raw bytes.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Copy from a slice, failing on length mismatch.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, crate::CryptoError> {
        let array: [u8; N] = bytes.try_into().map_err(|_| crate::CryptoError::InvalidKeyLength {
            expected: N,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Borrow the secret bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("len", &N).field("value", &"***").finish()
    }
}
