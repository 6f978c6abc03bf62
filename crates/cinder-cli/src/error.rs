//! CLI error types.

use cinder_core::E2eeError;
use thiserror::Error;

/// Errors surfaced by the `cinder` binary.
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file could not be read or parsed.
    ///
    /// Fatal: fix the file and rerun.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input was not valid base64 or hex.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Terminal or file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The encryption core rejected an operation or a wire message.
    #[error("protocol error ({}): {}", .0.code(), .0)]
    Protocol(#[from] E2eeError),
}
