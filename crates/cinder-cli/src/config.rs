//! TOML configuration loading.
//!
//! ```toml
//! [prekeys]
//! rotation_interval_secs = 604800
//! one_time_batch_size = 50
//!
//! [sender_keys]
//! rotation_threshold = 500
//! ```
//!
//! Missing tables and fields take their defaults.

use std::path::Path;

use cinder_core::E2eeConfig;

use crate::CliError;

/// Parse a TOML document.
pub fn parse_config(text: &str) -> Result<E2eeConfig, CliError> {
    toml::from_str(text).map_err(|e| CliError::Config(e.to_string()))
}

/// Load `path`, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<E2eeConfig, CliError> {
    let Some(path) = path else {
        return Ok(E2eeConfig::default());
    };

    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
    let config = parse_config(&text)?;

    tracing::info!(path = %path.display(), "loaded configuration");
    Ok(config)
}
