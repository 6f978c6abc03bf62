//! Operations for model-based testing.
//!
//! Generated randomly and applied to both the reference model and a real
//! [`SimWorld`](crate::SimWorld).

use arbitrary::Arbitrary;

/// Device index (clamped to the number of devices).
pub type DeviceId = u8;

/// Actions on a fully connected world of devices sharing one group.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// Pairwise sealed message.
    Send {
        /// Sender
        from: DeviceId,
        /// Recipient (ignored when equal to `from`)
        to: DeviceId,
        /// Payload
        content: SmallMessage,
    },

    /// Group message fanned out to every other device.
    GroupSend {
        /// Sender
        from: DeviceId,
        /// Payload
        content: SmallMessage,
    },

    /// Deliver one in-flight envelope, chosen by index modulo the queue
    /// length. Picking anything but the oldest reorders delivery.
    Deliver {
        /// Queue position
        index: u8,
    },

    /// Deliver an envelope that was already accepted once.
    Replay {
        /// Position in the delivered list
        index: u8,
    },

    /// Advance the shared clock.
    AdvanceTime {
        /// Minutes to advance
        minutes: u16,
    },

    /// Deliver everything in flight, oldest first.
    DeliverAll,
}

impl Operation {
    /// Map device ids into `0..num_devices`.
    #[must_use]
    pub fn clamp(self, num_devices: usize) -> Self {
        let clamp = |id: DeviceId| (id as usize % num_devices) as DeviceId;
        match self {
            Self::Send { from, to, content } => {
                Self::Send { from: clamp(from), to: clamp(to), content }
            },
            Self::GroupSend { from, content } => Self::GroupSend { from: clamp(from), content },
            other => other,
        }
    }
}

/// Compact payload: `len` bytes counting up from `seed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub struct SmallMessage {
    /// First byte
    pub seed: u8,
    /// Length (taken modulo 64)
    pub len: u8,
}

impl SmallMessage {
    /// Expanded payload bytes.
    pub fn to_bytes(self) -> Vec<u8> {
        (0..self.len % 64).map(|i| self.seed.wrapping_add(i)).collect()
    }
}

/// Why the model expects a delivery to be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Sender certificate expired while in flight
    Expired,
    /// Group iteration already passed
    Duplicate,
    /// Replay of an accepted envelope (exact error depends on ratchet
    /// history)
    Replay,
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Nothing observable happened
    Done,
    /// A message was accepted: `(from, to, plaintext)`
    Delivered(usize, usize, Vec<u8>),
    /// A message was refused
    Rejected(Rejection),
    /// Every in-flight message was delivered, with per-message outcomes
    DeliveredAll(Vec<OperationResult>),
}
