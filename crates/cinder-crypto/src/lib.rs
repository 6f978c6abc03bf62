//! Cinder Cryptographic Primitives
//!
//! Building blocks for the Cinder end-to-end encryption core. Pure functions
//! with deterministic outputs: callers provide random bytes, which keeps
//! every protocol above this crate reproducible under test.
//!
//! # Key Hierarchy
//!
//! ```text
//! Identity (X25519 + Ed25519)      Signed / one-time prekeys
//!              │                           │
//!              └──────── X3DH (4 DH) ──────┘
//!                           │
//!                           ▼
//!                 HKDF → root key ‖ chain key
//!                           │
//!            DH ratchet     ▼
//!     root key ─── HKDF(root, DH) ──→ new root ‖ new chain
//!                           │
//!                           ▼
//!             Symmetric ratchet → message keys
//!                           │
//!                           ▼
//!           ChaCha20-Poly1305 (AAD) → ciphertext
//! ```
//!
//! Group sender keys reuse the same symmetric ratchet, seeded from a random
//! chain key that is distributed over pairwise sessions.
//!
//! # Security
//!
//! - Every secret lives in a [`Secret`], zeroed on drop and compared in
//!   constant time
//! - Ratchet advancement replaces the chain key; past message keys cannot be
//!   recomputed
//! - Diffie-Hellman rejects non-contributory (low-order) public keys

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
mod error;
pub mod kdf;
pub mod keys;
pub mod ratchet;
mod secret;

pub use error::CryptoError;
pub use keys::{
    ENCODED_PUBLIC_KEY_SIZE, IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair, KeyPair, PublicKey,
    SIGNATURE_SIZE, Signature, SigningKeyPair, SigningPublicKey,
};
pub use ratchet::{MessageKey, SymmetricRatchet};
pub use secret::Secret;
