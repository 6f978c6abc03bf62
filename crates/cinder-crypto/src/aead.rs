//! ChaCha20-Poly1305 with associated data.
//!
//! Sealed output is `nonce (12) || ciphertext || tag (16)`. Callers supply
//! the nonce so tests can be deterministic; production callers draw it from
//! the environment RNG.

use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, Payload},
};

use crate::{CryptoError, Secret};

/// Nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` and bind `aad`, returning `nonce || ciphertext`.
pub fn encrypt(key: &Secret<32>, nonce: [u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Open `nonce || ciphertext` produced by [`encrypt`].
///
/// # Errors
///
/// - `DecryptionFailed`: input shorter than nonce plus tag, wrong key, wrong
///   associated data, or tampered ciphertext
pub fn decrypt(key: &Secret<32>, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed { reason: "ciphertext too short" });
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed" })
}
