//! Model-based testing.
//!
//! Random operation sequences are applied to both [`ModelWorld`] and a real
//! simulated world; observable outcomes must agree.

mod operation;
mod world;

pub use operation::{DeviceId, Operation, OperationResult, Rejection, SmallMessage};
pub use world::{ModelEnvelope, ModelKind, ModelWorld};
