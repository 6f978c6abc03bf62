//! Symmetric chain ratchet for forward-secure message key derivation
//!
//! Shared by pairwise session chains and group sender-key chains:
//!
//! ```text
//! message_key = HMAC-SHA256(chain_key, counter as u32 big-endian)
//! chain_key'  = HMAC-SHA256(chain_key, 0x01)
//! ```
//!
//! # Security Properties
//!
//! - Forward Secrecy: the previous chain key is dropped (and zeroed) when
//!   advancing
//! - Key Uniqueness: each counter produces a distinct message key
//! - Determinism: same chain key always produces the same key sequence

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::{CryptoError, Secret};

type HmacSha256 = Hmac<Sha256>;

/// Input for deriving the next chain key
const CHAIN_STEP: &[u8] = &[0x01];

/// A message key derived from the ratchet.
///
/// Used for exactly one encryption or decryption, then dropped.
#[derive(Clone, Debug)]
pub struct MessageKey {
    /// The 32-byte symmetric key for the AEAD
    key: Secret<32>,
    /// The counter (ratchet step) this key was derived for
    counter: u32,
}

impl MessageKey {
    /// Rebuild a message key from a cached secret (skipped-key cache).
    pub fn from_parts(key: Secret<32>, counter: u32) -> Self {
        Self { key, counter }
    }

    /// 32-byte AEAD key.
    pub fn key(&self) -> &Secret<32> {
        &self.key
    }

    /// Counter this key was derived for.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Split into the secret and its counter.
    pub fn into_parts(self) -> (Secret<32>, u32) {
        (self.key, self.counter)
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) call derives the message key for the
/// current counter, replaces the chain key with its successor, and increments
/// the counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricRatchet {
    /// Current chain key
    chain_key: Secret<32>,
    /// Counter of the next message key this ratchet will produce
    counter: u32,
}

impl SymmetricRatchet {
    /// Resume a ratchet at `counter` with the given chain key.
    pub fn new(chain_key: Secret<32>, counter: u32) -> Self {
        Self { chain_key, counter }
    }

    /// Counter of the next message key.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Current chain key.
    pub fn chain_key(&self) -> &Secret<32> {
        &self.chain_key
    }

    /// Split into chain key and counter.
    pub fn into_parts(self) -> (Secret<32>, u32) {
        (self.chain_key, self.counter)
    }

    /// Advance the ratchet and return the message key for the current
    /// counter.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterOverflow { current: self.counter });
        }

        let key = hmac(&self.chain_key, &self.counter.to_be_bytes());
        let next = hmac(&self.chain_key, CHAIN_STEP);

        // Old chain key is zeroed on drop
        self.chain_key = next;

        let counter = self.counter;
        self.counter += 1;

        Ok(MessageKey { key, counter })
    }

    /// Advance to `target` and return its message key, discarding the keys
    /// in between.
    ///
    /// At most `max_skip` intermediate keys are derived.
    pub fn advance_to(&mut self, target: u32, max_skip: u32) -> Result<MessageKey, CryptoError> {
        self.check_reachable(target, max_skip)?;

        while self.counter < target {
            self.advance()?;
        }
        self.advance()
    }

    /// Advance up to (not including) `target`, returning every intermediate
    /// message key so out-of-order messages can still be opened later.
    pub fn skip_to(&mut self, target: u32, max_skip: u32) -> Result<Vec<MessageKey>, CryptoError> {
        if target <= self.counter {
            return Ok(Vec::new());
        }
        self.check_reachable(target, max_skip)?;

        let mut skipped = Vec::with_capacity((target - self.counter) as usize);
        while self.counter < target {
            skipped.push(self.advance()?);
        }
        Ok(skipped)
    }

    fn check_reachable(&self, target: u32, max_skip: u32) -> Result<(), CryptoError> {
        if target < self.counter || target - self.counter > max_skip {
            return Err(CryptoError::CounterOutOfRange { current: self.counter, requested: target });
        }
        Ok(())
    }
}

fn hmac(key: &Secret<32>, input: &[u8]) -> Secret<32> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(input);
    let mut result = mac.finalize().into_bytes();

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&result);
    result.as_mut_slice().zeroize();
    Secret::from_bytes(*out)
}
