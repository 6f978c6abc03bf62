//! Curve25519 key types.
//!
//! Key agreement uses X25519 and signatures use Ed25519. An identity is the
//! pair of both, serialized as 65 bytes (`type | dh | signing`) so it fits the
//! fixed identity-key slot of the certificate layout.

use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::{CryptoError, Secret};

/// Size of a raw X25519 or Ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Type prefix for serialized Curve25519 keys.
pub const KEY_TYPE_CURVE25519: u8 = 0x05;

/// Size of a serialized (type-prefixed) DH public key.
pub const ENCODED_PUBLIC_KEY_SIZE: usize = 1 + PUBLIC_KEY_SIZE;

/// Size of a serialized identity key: type byte, DH key, signing key.
pub const IDENTITY_KEY_SIZE: usize = 1 + 2 * PUBLIC_KEY_SIZE;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Type-prefixed encoding used on the wire.
    pub fn encode(&self) -> [u8; ENCODED_PUBLIC_KEY_SIZE] {
        let mut out = [0u8; ENCODED_PUBLIC_KEY_SIZE];
        out[0] = KEY_TYPE_CURVE25519;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Parse the type-prefixed encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ENCODED_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: ENCODED_PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != KEY_TYPE_CURVE25519 {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&bytes[1..]);
        Ok(Self(key))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

/// X25519 key pair used for identity DH, prekeys, ephemerals and ratchet
/// keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    public: PublicKey,
    secret: Secret<32>,
}

impl KeyPair {
    /// Build a key pair from 32 random bytes supplied by the caller.
    pub fn from_random(mut bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);

        let public = x25519_dalek::PublicKey::from(&secret);
        Self { public: PublicKey(public.to_bytes()), secret: Secret::from_bytes(secret.to_bytes()) }
    }

    /// Public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Compute the X25519 shared secret with a peer public key.
    ///
    /// Rejects peer keys that produce a non-contributory (all-zero) result.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Result<Secret<32>, CryptoError> {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(their_public.0));

        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok(Secret::from_bytes(*shared.as_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Wrap raw signature bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, failing on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: SIGNATURE_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(array))
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningPublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl SigningPublicKey {
    /// Wrap raw key bytes. Validity is checked on [`Self::verify`].
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);

        key.verify(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({})", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signing key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyPair {
    public: SigningPublicKey,
    secret: Secret<32>,
}

impl SigningKeyPair {
    /// Build a signing key pair from a 32-byte random seed.
    pub fn from_random(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let public = SigningPublicKey(signing.verifying_key().to_bytes());

        Self { public, secret: Secret::from_bytes(*seed) }
    }

    /// Verifying half.
    pub fn public_key(&self) -> &SigningPublicKey {
        &self.public
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = ed25519_dalek::SigningKey::from_bytes(self.secret.as_bytes());
        Signature(signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Public identity: long-term DH key plus long-term signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    dh: PublicKey,
    signing: SigningPublicKey,
}

impl IdentityKey {
    /// Combine the two public halves.
    pub fn new(dh: PublicKey, signing: SigningPublicKey) -> Self {
        Self { dh, signing }
    }

    /// Long-term X25519 key.
    pub fn dh_key(&self) -> &PublicKey {
        &self.dh
    }

    /// Long-term Ed25519 key.
    pub fn signing_key(&self) -> &SigningPublicKey {
        &self.signing
    }

    /// 65-byte encoding: `0x05 | dh | signing`.
    pub fn encode(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut out = [0u8; IDENTITY_KEY_SIZE];
        out[0] = KEY_TYPE_CURVE25519;
        out[1..33].copy_from_slice(self.dh.as_bytes());
        out[33..].copy_from_slice(self.signing.as_bytes());
        out
    }

    /// Parse the 65-byte encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: IDENTITY_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != KEY_TYPE_CURVE25519 {
            return Err(CryptoError::InvalidPublicKey);
        }

        let mut dh = [0u8; PUBLIC_KEY_SIZE];
        let mut signing = [0u8; PUBLIC_KEY_SIZE];
        dh.copy_from_slice(&bytes[1..33]);
        signing.copy_from_slice(&bytes[33..]);

        Ok(Self { dh: PublicKey(dh), signing: SigningPublicKey(signing) })
    }

    /// Verify a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.signing.verify(message, signature)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", hex::encode(&self.dh.as_bytes()[..8]))
    }
}

/// Long-term identity key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    dh: KeyPair,
    signing: SigningKeyPair,
}

impl IdentityKeyPair {
    /// Build from two independent 32-byte random seeds.
    pub fn from_random(dh_seed: [u8; 32], signing_seed: [u8; 32]) -> Self {
        Self {
            dh: KeyPair::from_random(dh_seed),
            signing: SigningKeyPair::from_random(signing_seed),
        }
    }

    /// Public identity.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey { dh: *self.dh.public_key(), signing: *self.signing.public_key() }
    }

    /// DH half, for X3DH and sealed-sender key agreement.
    pub fn dh_key_pair(&self) -> &KeyPair {
        &self.dh
    }

    /// Sign with the long-term signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}
