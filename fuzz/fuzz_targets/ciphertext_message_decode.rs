//! Fuzz target for CiphertextMessage::from_bytes
//!
//! Covers both PreKey and Ratchet bodies, including the optional one-time
//! prekey id. Must never panic; accepted messages round-trip.

#![no_main]

use cinder_core::CiphertextMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = CiphertextMessage::from_bytes(data) {
        let again = CiphertextMessage::from_bytes(&message.to_bytes())
            .expect("re-encoded message must decode");
        assert_eq!(again, message);
    }
});
