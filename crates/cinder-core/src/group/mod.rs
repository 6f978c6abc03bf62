//! Group encryption with sender keys.
//!
//! Each member holds one symmetric chain per group and signs what it sends.
//! A message is encrypted once and fanned out; every other member decrypts
//! with the copy of the chain it received through a pairwise session.
//!
//! ```text
//! messageKey = HMAC(chainKey, iteration)
//! chainKey'  = HMAC(chainKey, 0x01)
//! signature  = Ed25519(ad ‖ nonce ‖ ciphertext)
//! ```
//!
//! Membership is not observed here: callers rotate on membership change.

mod manager;
mod message;
mod state;

pub use manager::SenderKeyManager;
pub use message::{SENDER_KEY_MESSAGE_VERSION, SenderKeyDistributionMessage, SenderKeyMessage};
