//! Cinder encryption core
//!
//! Key management and the protocol stack for end-to-end encrypted
//! messaging, built on `cinder-crypto`:
//!
//! - [`prekey`]: signed prekey generation, rotation and archival, plus
//!   one-time prekeys
//! - [`x3dh`]: asynchronous key agreement from a published bundle
//! - [`session`]: pairwise Double Ratchet sessions
//! - [`sealed_sender`]: envelopes that hide the sender from the transport
//! - [`group`]: sender-key group encryption
//! - [`E2eeClient`]: one device's view composing all of the above
//!
//! # Architecture
//!
//! ```text
//!                    E2eeClient
//!        ┌──────────────┼──────────────────┐
//!        ▼              ▼                  ▼
//!  PreKeyManager ◄─ SessionManager   SenderKeyManager
//!        │              │   ▲              │
//!        │              ▼   │ x3dh         │
//!        │          sealed_sender          │
//!        └──────────────┬──────────────────┘
//!                       ▼
//!            Storage  +  Environment
//! ```
//!
//! Every manager takes its storage backend and environment by value. Time
//! and randomness come only from [`Environment`], so the whole stack runs
//! deterministically under a simulated clock and seeded RNG.
//!
//! # Concurrency
//!
//! Ratchet advancement is stateful: concurrent operations on the same peer
//! session or the same sender key are serialized by per-key async locks.
//! Operations on different sessions or groups run in parallel.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod client;
mod codec;
pub mod config;
pub mod env;
mod error;
pub mod group;
pub mod identity;
mod locks;
pub mod prekey;
pub mod sealed_sender;
pub mod session;
pub mod storage;
pub mod x3dh;

pub use client::{Delivery, E2eeClient, MaintenanceReport};
pub use config::{E2eeConfig, PreKeyConfig, SenderKeyConfig, SessionConfig};
pub use env::{Environment, SystemEnv};
pub use error::E2eeError;
pub use group::{SenderKeyDistributionMessage, SenderKeyManager, SenderKeyMessage};
pub use identity::{IdentityManager, LocalIdentity};
pub use prekey::{OneTimePreKey, PreKeyManager, SignedPreKey};
pub use sealed_sender::{
    CertificateAuthority, CertificateVerifier, MessageType, SealedSenderEnvelope,
    SenderCertificate, UnsealedMessage,
};
pub use session::{CiphertextMessage, PeerAddress, SessionManager, SessionSummary};
pub use storage::{
    ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError, TieredStorage,
};
pub use x3dh::{PreKeyBundle, PreKeyMessage};
