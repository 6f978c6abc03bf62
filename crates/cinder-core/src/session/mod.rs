//! Pairwise Double Ratchet sessions.
//!
//! Bootstrap is asymmetric: the X3DH initiator starts with only a sending
//! chain, the responder with only a receiving chain. The responder's first
//! reply performs a DH ratchet step that gives both sides both chains.
//!
//! ```text
//! Alice (initiator)                        Bob (responder)
//!   create_session(bundle)
//!   encrypt ──── PreKey{x3dh, msg} ─────►  decrypt: X3DH responder, session
//!                                          encrypt: DH ratchet (send half)
//!   decrypt: DH ratchet (recv + send) ◄─── Ratchet{msg}
//!   encrypt ──── Ratchet{msg} ──────────►  decrypt: DH ratchet (recv + send)
//! ```

mod manager;
mod message;
mod ratchet;
mod state;

pub use manager::{PeerAddress, SessionManager};
pub use message::{CiphertextMessage, RATCHET_MESSAGE_VERSION, RatchetMessage};
pub use state::{SessionState, SessionSummary};
