//! Key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::Secret;

/// Info label for the X3DH output (root key and first chain key)
pub const X3DH_LABEL: &[u8] = b"CinderX3DH";

/// Info label for the Double Ratchet root step
pub const RATCHET_LABEL: &[u8] = b"CinderRatchet";

/// Info label for the sealed-sender envelope key
pub const SEALED_SENDER_LABEL: &[u8] = b"CinderSealedSenderV1";

/// Run HKDF-SHA256 and return `N` bytes of output keying material.
///
/// `N` must not exceed 255 * 32 bytes; every caller in this workspace asks
/// for 32 or 64.
pub fn hkdf<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Secret<N> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = Zeroizing::new([0u8; N]);
    let Ok(()) = hkdf.expand(info, &mut okm[..]) else {
        unreachable!("output length is a valid HKDF-SHA256 length");
    };

    Secret::from_bytes(*okm)
}

/// Split 64 bytes of key material into two 32-byte keys.
pub fn split(material: &Secret<64>) -> (Secret<32>, Secret<32>) {
    let bytes = material.as_bytes();

    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&bytes[..32]);
    second.copy_from_slice(&bytes[32..]);

    (Secret::from_bytes(*first), Secret::from_bytes(*second))
}

/// Double Ratchet root step.
///
/// Mixes a fresh DH output into the root key and returns
/// `(next_root_key, chain_key)`.
pub fn derive_root_step(root_key: &Secret<32>, dh_output: &Secret<32>) -> (Secret<32>, Secret<32>) {
    let material = hkdf::<64>(Some(root_key.as_bytes()), dh_output.as_bytes(), RATCHET_LABEL);
    split(&material)
}
