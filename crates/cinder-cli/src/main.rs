//! Cinder command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Walk three in-memory devices through sessions, sealed sender and groups
//! cinder demo --config cinder.toml
//!
//! # Dump the header of a base64 sealed-sender envelope
//! cinder inspect-envelope BAEhBQ...
//!
//! # Decode a hex certificate and check it against an authority key
//! cinder inspect-certificate --encoding hex 01000561... --server-key 3b6a27bc...
//! ```

use std::{io::Write, path::PathBuf};

use cinder_cli::{
    Encoding, inspect_certificate, inspect_envelope, load_config, parse_signing_key, run_demo,
};
use cinder_core::{Environment, SystemEnv};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Cinder end-to-end encryption toolkit
#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(about = "Demo and wire-format inspector for the Cinder encryption core")]
#[command(version)]
struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes
    /// precedence
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an in-process session, sealed sender and group walkthrough
    Demo,

    /// Decode a sealed-sender envelope and print its header
    InspectEnvelope {
        /// Encoded envelope
        input: String,

        /// Encoding of `input`
        #[arg(long, value_enum, default_value_t = Encoding::Base64)]
        encoding: Encoding,
    },

    /// Decode a sender certificate, check expiry and optionally its
    /// signature
    InspectCertificate {
        /// Encoded certificate
        input: String,

        /// Encoding of `input`
        #[arg(long, value_enum, default_value_t = Encoding::Base64)]
        encoding: Encoding,

        /// Hex Ed25519 authority key to verify the signature with
        #[arg(long)]
        server_key: Option<String>,

        /// Key id the authority key is trusted under
        #[arg(long, default_value_t = 1)]
        server_key_id: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut out = std::io::stdout();
    match args.command {
        Command::Demo => {
            let config = load_config(args.config.as_deref())?;
            for line in run_demo(&config).await? {
                writeln!(out, "{line}")?;
            }
        },
        Command::InspectEnvelope { input, encoding } => {
            writeln!(out, "{}", inspect_envelope(&input, encoding)?)?;
        },
        Command::InspectCertificate { input, encoding, server_key, server_key_id } => {
            let authority = server_key
                .map(|key| parse_signing_key(&key).map(|key| (server_key_id, key)))
                .transpose()?;
            let now = SystemEnv::new().now_millis();
            writeln!(out, "{}", inspect_certificate(&input, encoding, now, authority)?)?;
        },
    }

    Ok(())
}
