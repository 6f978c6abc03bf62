//! Fuzz target for the HMAC chain ratchet and AEAD
//!
//! # Strategy
//!
//! - Arbitrary chain keys and starting counters (including near u32::MAX)
//! - Random sequences of advance, advance_to and skip_to
//! - Encrypt/decrypt with the derived keys, then corrupt the output
//!
//! # Invariants
//!
//! - Ratchet never panics; overflow and out-of-range targets are errors
//! - advance_to(n) yields the same key as skip_to(n) followed by advance()
//! - Message keys are unique within a chain
//! - Encrypt/decrypt roundtrip succeeds; any flipped byte fails

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use cinder_crypto::{Secret, SymmetricRatchet, aead};
use libfuzzer_sys::fuzz_target;

const MAX_SKIP: u32 = 512;

#[derive(Debug, Arbitrary)]
struct ChainScenario {
    chain_key: [u8; 32],
    start: u32,
    operations: Vec<ChainOperation>,
    nonce: [u8; aead::NONCE_SIZE],
}

#[derive(Debug, Arbitrary)]
enum ChainOperation {
    Advance,
    AdvanceBy { steps: u16 },
    SkipBy { steps: u16 },
    Seal { plaintext: Vec<u8>, aad: Vec<u8>, flip: u16 },
}

fuzz_target!(|scenario: ChainScenario| {
    let chain_key = Secret::from_bytes(scenario.chain_key);
    let mut ratchet = SymmetricRatchet::new(chain_key, scenario.start);
    let mut seen = HashSet::new();

    for op in scenario.operations {
        let before = ratchet.counter();
        match op {
            ChainOperation::Advance => {
                if let Ok(key) = ratchet.advance() {
                    assert_eq!(key.counter(), before);
                    assert!(seen.insert(*key.key().as_bytes()), "message key repeated");
                } else {
                    assert_eq!(before, u32::MAX, "advance only fails at overflow");
                }
            },

            ChainOperation::AdvanceBy { steps } => {
                let target = before.saturating_add(u32::from(steps));
                if target == u32::MAX {
                    // advance_to would overflow after partially advancing
                    continue;
                }

                let mut shadow = SymmetricRatchet::new(ratchet.chain_key().clone(), before);
                let result = ratchet.advance_to(target, MAX_SKIP);
                if let Ok(key) = result {
                    assert_eq!(key.counter(), target);
                    assert_eq!(ratchet.counter(), target + 1);

                    let skipped =
                        shadow.skip_to(target, MAX_SKIP).expect("same bound as advance_to");
                    assert_eq!(skipped.len() as u32, target - before);
                    let same = shadow.advance().expect("advance_to succeeded at this counter");
                    assert_eq!(same.key(), key.key(), "advance_to diverged from skip_to + advance");
                } else {
                    assert_eq!(ratchet.counter(), before, "failed advance_to must not move");
                }
            },

            ChainOperation::SkipBy { steps } => {
                let target = before.saturating_add(u32::from(steps));
                match ratchet.skip_to(target, MAX_SKIP) {
                    Ok(keys) => {
                        for (offset, key) in keys.iter().enumerate() {
                            assert_eq!(key.counter(), before + offset as u32);
                            assert!(seen.insert(*key.key().as_bytes()), "message key repeated");
                        }
                        assert_eq!(ratchet.counter(), target);
                    },
                    Err(_) => assert_eq!(ratchet.counter(), before),
                }
            },

            ChainOperation::Seal { plaintext, aad, flip } => {
                let Ok(key) = ratchet.advance() else {
                    continue;
                };
                let sealed = aead::encrypt(key.key(), scenario.nonce, &plaintext, &aad);
                assert_eq!(sealed.len(), aead::NONCE_SIZE + plaintext.len() + aead::TAG_SIZE);

                let opened = aead::decrypt(key.key(), &sealed, &aad).expect("roundtrip");
                assert_eq!(opened, plaintext);

                let mut corrupted = sealed.clone();
                let index = usize::from(flip) % corrupted.len();
                corrupted[index] ^= 0x01;
                let tampered = aead::decrypt(key.key(), &corrupted, &aad);
                assert!(tampered.is_err(), "tampering undetected");
            },
        }
    }
});
