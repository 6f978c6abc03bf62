//! Fuzz target for sender-key group messaging
//!
//! Drives a sending and a receiving `SenderKeyManager` through arbitrary
//! sends, reordered deliveries, tampering, rotations and raw wire bytes.
//!
//! # Invariants
//!
//! - Nothing panics, whatever the receiver is fed
//! - A message decrypts at most once and only to what was sent
//! - An older iteration is refused once a newer one is accepted
//! - A tampered message never decrypts
//! - After rotation, old-key messages still decrypt under the old key id

#![no_main]

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arbitrary::Arbitrary;
use cinder_core::{
    E2eeError, Environment, MemoryStorage, SenderKeyManager, SenderKeyMessage,
    config::SenderKeyConfig,
};
use libfuzzer_sys::fuzz_target;

const GROUP: &str = "fuzz-group";

/// Deterministic environment: splitmix64 bytes, fixed clock.
#[derive(Clone)]
struct FuzzEnv {
    state: Arc<AtomicU64>,
}

impl Environment for FuzzEnv {
    fn now_millis(&self) -> u64 {
        1_700_000_000_000
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let mut z = self.state.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
        }
    }
}

#[derive(Debug, Arbitrary)]
struct GroupScenario {
    seed: u64,
    operations: Vec<GroupOperation>,
}

#[derive(Debug, Arbitrary)]
enum GroupOperation {
    Send { plaintext: Vec<u8> },
    Deliver { index: u8 },
    DeliverTampered { index: u8, byte: u16 },
    Rotate,
    Raw { bytes: Vec<u8> },
}

struct Sent {
    message: SenderKeyMessage,
    plaintext: Vec<u8>,
    delivered: bool,
}

fuzz_target!(|scenario: GroupScenario| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("current-thread runtime");
    runtime.block_on(run(scenario));
});

async fn run(scenario: GroupScenario) {
    let env = FuzzEnv { state: Arc::new(AtomicU64::new(scenario.seed)) };
    let config = SenderKeyConfig::default();
    let max_future_iterations = config.max_future_iterations;
    let sender = SenderKeyManager::new(MemoryStorage::new(), env.clone(), "alice", config.clone());
    let receiver = SenderKeyManager::new(MemoryStorage::new(), env, "bob", config);

    sender.create_sender_key(GROUP).await.expect("create");
    let distribution = sender.create_distribution_message(GROUP).await.expect("distribution");
    receiver.process_sender_key_distribution("alice", &distribution).await.expect("process");

    let mut sent: Vec<Sent> = Vec::new();
    let mut key_ids = vec![distribution.key_id];

    for op in scenario.operations {
        match op {
            GroupOperation::Send { plaintext } => {
                let message = sender.encrypt_group_message(GROUP, &plaintext).await.expect("send");
                sent.push(Sent { message, plaintext, delivered: false });
            },

            GroupOperation::Deliver { index } => {
                if sent.is_empty() {
                    continue;
                }
                let index = usize::from(index) % sent.len();
                let newest_accepted = sent
                    .iter()
                    .filter(|s| s.delivered && s.message.key_id == sent[index].message.key_id)
                    .map(|s| s.message.iteration)
                    .max();

                let entry = &mut sent[index];
                match receiver.decrypt_group_message("alice", &entry.message).await {
                    Ok(plaintext) => {
                        assert!(!entry.delivered, "message decrypted twice");
                        assert!(
                            newest_accepted.is_none_or(|newest| entry.message.iteration > newest),
                            "older iteration accepted after a newer one"
                        );
                        assert_eq!(plaintext, entry.plaintext);
                        entry.delivered = true;
                    },
                    Err(E2eeError::DuplicateMessage) => {
                        assert!(
                            entry.delivered
                                || newest_accepted.is_some_and(|n| entry.message.iteration < n),
                            "fresh message refused as duplicate"
                        );
                    },
                    Err(E2eeError::OutdatedMessage) => {
                        let floor = newest_accepted.map_or(0, |n| n + 1);
                        assert!(entry.message.iteration - floor > max_future_iterations);
                    },
                    Err(other) => panic!("unexpected rejection of a genuine message: {other:?}"),
                }
            },

            GroupOperation::DeliverTampered { index, byte } => {
                if sent.is_empty() {
                    continue;
                }
                let index = usize::from(index) % sent.len();
                let mut wire = sent[index].message.encode().to_vec();
                let position = usize::from(byte) % wire.len();
                wire[position] ^= 0x80;

                if let Ok(tampered) = SenderKeyMessage::decode(&wire) {
                    let result = receiver.decrypt_group_message("alice", &tampered).await;
                    assert!(result.is_err(), "tampered message decrypted");
                }
            },

            GroupOperation::Rotate => {
                let distribution = sender.rotate_sender_key(GROUP).await.expect("rotate");
                if key_ids.contains(&distribution.key_id) {
                    // Random key id collided with an older generation
                    return;
                }
                key_ids.push(distribution.key_id);
                receiver
                    .process_sender_key_distribution("alice", &distribution)
                    .await
                    .expect("process rotation");
            },

            GroupOperation::Raw { bytes } => {
                let Ok(message) = SenderKeyMessage::decode(&bytes) else {
                    continue;
                };
                if !sent.iter().any(|s| s.message == message) {
                    // Unsigned by the sender's key: must never be accepted
                    let result = receiver.decrypt_group_message("alice", &message).await;
                    assert!(result.is_err(), "forged message accepted");
                }
            },
        }
    }
}
