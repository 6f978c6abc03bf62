//! Deterministic simulation harness for the Cinder encryption core.
//!
//! [`SimEnv`] replaces wall-clock time and OS randomness with a manual clock
//! and a seeded ChaCha stream, so prekey rotation, archive expiry and
//! certificate expiry are tested by moving the clock instead of sleeping.
//!
//! [`SimWorld`] runs several full clients against one certificate
//! authority and queues sealed envelopes between them, letting tests choose
//! delivery order.
//!
//! # Model-Based Testing
//!
//! The `model` module provides a reference implementation. Operations are
//! applied to both the model and a real world and their observable outcomes
//! are compared.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_env;
pub mod world;

pub use model::{ModelWorld, Operation, OperationResult, Rejection, SmallMessage};
pub use sim_env::{SIM_START_MILLIS, SimEnv};
pub use world::{CERTIFICATE_LIFETIME, InFlight, SimClient, SimWorld};
