//! Reference model: what a correct implementation must observably do.

use std::collections::HashMap;

use super::operation::{Operation, OperationResult, Rejection};
use crate::{sim_env::SIM_START_MILLIS, world::CERTIFICATE_LIFETIME};

/// Kind of a modelled envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Pairwise Double Ratchet message
    Pairwise,
    /// Sender-key message at this iteration
    Group(u32),
}

/// Modelled envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEnvelope {
    /// Sending device
    pub from: usize,
    /// Receiving device
    pub to: usize,
    /// Pairwise or group
    pub kind: ModelKind,
    /// Expected plaintext
    pub content: Vec<u8>,
    /// Certificate expiry (Unix ms)
    pub expires_at: u64,
}

/// Reference model of a fully connected world sharing one group.
///
/// Pairwise sessions deliver every message regardless of order. Sender
/// keys keep no skipped keys, so a group message older than one already
/// delivered from the same sender is a duplicate.
#[derive(Debug, Clone)]
pub struct ModelWorld {
    num_devices: usize,
    now: u64,
    in_flight: Vec<ModelEnvelope>,
    delivered: Vec<ModelEnvelope>,
    /// Next group iteration each device sends
    group_iteration: Vec<u32>,
    /// Lowest group iteration `to` still accepts from `from`
    group_accepts: HashMap<(usize, usize), u32>,
}

impl ModelWorld {
    /// Model with `num_devices` devices at the simulation start time.
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            now: SIM_START_MILLIS,
            in_flight: Vec::new(),
            delivered: Vec::new(),
            group_iteration: vec![0; num_devices],
            group_accepts: HashMap::new(),
        }
    }

    /// Number of devices.
    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Envelopes in flight.
    pub fn in_flight(&self) -> &[ModelEnvelope] {
        &self.in_flight
    }

    /// Apply `op`, which must already be clamped.
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        match op {
            Operation::Send { from, to, content } => {
                let (from, to) = (*from as usize, *to as usize);
                if from != to {
                    let envelope = self.envelope(from, to, ModelKind::Pairwise, content.to_bytes());
                    self.in_flight.push(envelope);
                }
                OperationResult::Done
            },
            Operation::GroupSend { from, content } => {
                let from = *from as usize;
                let iteration = self.group_iteration[from];
                self.group_iteration[from] += 1;

                let content = content.to_bytes();
                for to in (0..self.num_devices).filter(|&to| to != from) {
                    let envelope =
                        self.envelope(from, to, ModelKind::Group(iteration), content.clone());
                    self.in_flight.push(envelope);
                }
                OperationResult::Done
            },
            Operation::Deliver { index } => {
                if self.in_flight.is_empty() {
                    return OperationResult::Done;
                }
                let index = *index as usize % self.in_flight.len();
                self.deliver(index)
            },
            Operation::Replay { .. } => {
                if self.delivered.is_empty() {
                    return OperationResult::Done;
                }
                OperationResult::Rejected(Rejection::Replay)
            },
            Operation::AdvanceTime { minutes } => {
                self.now += u64::from(*minutes) * 60 * 1000;
                OperationResult::Done
            },
            Operation::DeliverAll => {
                let mut results = Vec::with_capacity(self.in_flight.len());
                while !self.in_flight.is_empty() {
                    results.push(self.deliver(0));
                }
                OperationResult::DeliveredAll(results)
            },
        }
    }

    fn envelope(&self, from: usize, to: usize, kind: ModelKind, content: Vec<u8>) -> ModelEnvelope {
        ModelEnvelope {
            from,
            to,
            kind,
            content,
            expires_at: self.now + CERTIFICATE_LIFETIME.as_millis() as u64,
        }
    }

    fn deliver(&mut self, index: usize) -> OperationResult {
        let envelope = self.in_flight.remove(index);

        if envelope.expires_at < self.now {
            return OperationResult::Rejected(Rejection::Expired);
        }

        if let ModelKind::Group(iteration) = envelope.kind {
            let accepts = self.group_accepts.entry((envelope.from, envelope.to)).or_insert(0);
            if iteration < *accepts {
                return OperationResult::Rejected(Rejection::Duplicate);
            }
            *accepts = iteration + 1;
        }

        let result =
            OperationResult::Delivered(envelope.from, envelope.to, envelope.content.clone());
        self.delivered.push(envelope);
        result
    }
}
