//! Fuzz target for SenderCertificate::decode
//!
//! Length prefixes are attacker controlled; the parser must reject
//! truncation and overlong fields without panicking. A decoded certificate
//! survives a re-encode unchanged and never verifies without a trusted key.

#![no_main]

use cinder_core::{CertificateVerifier, SenderCertificate};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(certificate) = SenderCertificate::decode(data) else {
        return;
    };

    let reencoded = SenderCertificate::decode(&certificate.encode())
        .expect("re-encoded certificate must decode");
    assert_eq!(reencoded, certificate);

    assert!(!CertificateVerifier::new().verify(&certificate), "empty trust store accepts nothing");
});
