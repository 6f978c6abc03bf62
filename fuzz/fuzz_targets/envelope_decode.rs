//! Fuzz target for SealedSenderEnvelope::decode
//!
//! Arbitrary bytes (and the same bytes as base64 text) must never panic the
//! envelope parser. Anything accepted re-encodes to the exact input, since
//! the layout has no optional or padded fields.

#![no_main]

use cinder_core::SealedSenderEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = SealedSenderEnvelope::decode(data) {
        assert_eq!(envelope.encode().as_ref(), data, "accepted envelope must be canonical");
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = SealedSenderEnvelope::from_base64(text);
    }
});
