//! Support library for the `cinder` binary.
//!
//! - [`config`]: TOML configuration loading
//! - [`demo`]: in-process three-device walkthrough
//! - [`inspect`]: decoding of envelopes and certificates for debugging

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod demo;
mod error;
pub mod inspect;

pub use config::{load_config, parse_config};
pub use demo::run_demo;
pub use error::CliError;
pub use inspect::{
    CertificateReport, Encoding, EnvelopeReport, SignatureStatus, inspect_certificate,
    inspect_envelope, parse_signing_key,
};
