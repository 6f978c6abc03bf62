//! Model-based property tests.
//!
//! Random operation sequences run against the reference model and against a
//! real [`SimWorld`] of full clients. Both must agree on every delivery: who
//! sent it, what it said, and why it was refused.
//!
//! ```text
//! proptest generates: Vec<Operation>
//!                          │
//!           ┌──────────────┼──────────────┐
//!           ▼              ▼              ▼
//!      ModelWorld      RealWorld       Compare
//!      (reference)     (SimWorld)      Results
//! ```

use std::time::Duration;

use cinder_core::E2eeError;
use cinder_harness::{
    InFlight, ModelWorld, Operation, OperationResult, Rejection, SimWorld, SmallMessage,
};
use proptest::prelude::*;

const GROUP: &str = "model-group";

/// Real system wrapper that mirrors [`ModelWorld::apply`].
struct RealWorld {
    world: SimWorld,
    /// Envelopes delivered during setup, excluded from replay
    setup_delivered: usize,
}

impl RealWorld {
    async fn new(num_devices: usize, seed: u64) -> Self {
        let mut world = SimWorld::with_devices(seed, num_devices).await.unwrap();
        world.connect_all().await.unwrap();
        world.setup_group(GROUP).await.unwrap();
        let setup_delivered = world.delivered().len();

        Self { world, setup_delivered }
    }

    async fn apply(&mut self, op: &Operation) -> OperationResult {
        match op {
            Operation::Send { from, to, content } => {
                let (from, to) = (*from as usize, *to as usize);
                if from != to {
                    self.world.send(from, to, &content.to_bytes()).await.unwrap();
                }
                OperationResult::Done
            },
            Operation::GroupSend { from, content } => {
                self.world.send_group(*from as usize, GROUP, &content.to_bytes()).await.unwrap();
                OperationResult::Done
            },
            Operation::Deliver { index } => {
                let pending = self.world.in_flight().len();
                if pending == 0 {
                    return OperationResult::Done;
                }
                self.deliver(*index as usize % pending).await
            },
            Operation::Replay { index } => {
                let replayable = self.world.delivered().len() - self.setup_delivered;
                if replayable == 0 {
                    return OperationResult::Done;
                }
                let index = self.setup_delivered + *index as usize % replayable;
                let InFlight { from, to, .. } = self.world.delivered()[index].clone();
                match self.world.replay(index).await {
                    Ok(delivery) => OperationResult::Delivered(from, to, delivery.plaintext),
                    Err(_) => OperationResult::Rejected(Rejection::Replay),
                }
            },
            Operation::AdvanceTime { minutes } => {
                self.world.env().advance(Duration::from_secs(u64::from(*minutes) * 60));
                OperationResult::Done
            },
            Operation::DeliverAll => {
                let mut results = Vec::with_capacity(self.world.in_flight().len());
                while !self.world.in_flight().is_empty() {
                    results.push(self.deliver(0).await);
                }
                OperationResult::DeliveredAll(results)
            },
        }
    }

    async fn deliver(&mut self, index: usize) -> OperationResult {
        let (InFlight { from, to, .. }, result) = self.world.deliver(index).await;
        match result {
            Ok(delivery) => {
                assert_eq!(delivery.sender, self.world.address(from), "sender attribution");
                OperationResult::Delivered(from, to, delivery.plaintext)
            },
            Err(E2eeError::InvalidCertificate) => OperationResult::Rejected(Rejection::Expired),
            Err(E2eeError::DuplicateMessage) => OperationResult::Rejected(Rejection::Duplicate),
            Err(e) => panic!("unexpected rejection {from} -> {to}: {e:?}"),
        }
    }
}

fn small_message_strategy() -> impl Strategy<Value = SmallMessage> + Clone {
    (any::<u8>(), any::<u8>()).prop_map(|(seed, len)| SmallMessage { seed, len })
}

/// Strategy for operations over `num_devices` devices.
fn operation_strategy(num_devices: usize) -> impl Strategy<Value = Operation> {
    let device = 0..num_devices as u8;
    let content = small_message_strategy();

    prop_oneof![
        // Weight towards sending and delivering
        5 => (device.clone(), device.clone(), content.clone())
            .prop_map(|(from, to, content)| Operation::Send { from, to, content }),
        3 => (device, content).prop_map(|(from, content)| Operation::GroupSend { from, content }),
        6 => any::<u8>().prop_map(|index| Operation::Deliver { index }),
        1 => any::<u8>().prop_map(|index| Operation::Replay { index }),
        // Mostly short steps, occasionally past certificate expiry
        2 => prop_oneof![0..120u16, 1400..1500u16]
            .prop_map(|minutes| Operation::AdvanceTime { minutes }),
        1 => Just(Operation::DeliverAll),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every operation yields the same observable result in model and real
    /// world.
    #[test]
    fn prop_model_matches_real(
        seed in any::<u64>(),
        num_devices in 2..4usize,
        ops in prop::collection::vec(operation_strategy(3), 0..40)
    ) {
        let runtime = runtime();
        let mut model = ModelWorld::new(num_devices);
        let mut real = runtime.block_on(RealWorld::new(num_devices, seed));

        for (i, op) in ops.iter().enumerate() {
            let op = op.clone().clamp(num_devices);

            let model_result = model.apply(&op);
            let real_result = runtime.block_on(real.apply(&op));

            prop_assert_eq!(
                &model_result,
                &real_result,
                "Divergence at operation {}: {:?}",
                i,
                op
            );
        }

        // Flush: nothing may be left undelivered or silently lost
        let model_rest = model.apply(&Operation::DeliverAll);
        let real_rest = runtime.block_on(real.apply(&Operation::DeliverAll));
        prop_assert_eq!(model_rest, real_rest);
        prop_assert!(real.world.in_flight().is_empty());
    }

    /// The model alone: every accepted delivery reaches the addressed device
    /// with the sent bytes, and flushing empties the queue.
    #[test]
    fn prop_model_invariants(
        num_devices in 2..5usize,
        ops in prop::collection::vec(operation_strategy(4), 0..100)
    ) {
        let mut model = ModelWorld::new(num_devices);

        for op in ops {
            let op = op.clamp(num_devices);
            if let OperationResult::Delivered(from, to, _) = model.apply(&op) {
                prop_assert!(from != to);
                prop_assert!(from < num_devices && to < num_devices);
            }
        }

        model.apply(&Operation::DeliverAll);
        prop_assert!(model.in_flight().is_empty());
    }
}

#[test]
fn expired_certificate_matches_model() {
    let runtime = runtime();
    let mut model = ModelWorld::new(2);
    let mut real = runtime.block_on(RealWorld::new(2, 99));

    let ops = [
        Operation::Send { from: 0, to: 1, content: SmallMessage { seed: 1, len: 4 } },
        Operation::GroupSend { from: 1, content: SmallMessage { seed: 2, len: 4 } },
        Operation::AdvanceTime { minutes: 24 * 60 + 1 },
        Operation::Send { from: 0, to: 1, content: SmallMessage { seed: 3, len: 4 } },
        Operation::DeliverAll,
    ];

    let mut last = None;
    for op in &ops {
        let expected = model.apply(op);
        let actual = runtime.block_on(real.apply(op));
        assert_eq!(expected, actual, "{op:?}");
        last = Some(actual);
    }

    assert_eq!(
        last,
        Some(OperationResult::DeliveredAll(vec![
            OperationResult::Rejected(Rejection::Expired),
            OperationResult::Rejected(Rejection::Expired),
            OperationResult::Delivered(0, 1, vec![3, 4, 5, 6]),
        ]))
    );
}

#[test]
fn reordered_group_delivery_matches_model() {
    let runtime = runtime();
    let mut model = ModelWorld::new(3);
    let mut real = runtime.block_on(RealWorld::new(3, 7));

    let ops = [
        Operation::GroupSend { from: 2, content: SmallMessage { seed: 10, len: 2 } },
        Operation::GroupSend { from: 2, content: SmallMessage { seed: 20, len: 2 } },
        // Queue: [2->0 #0, 2->1 #0, 2->0 #1, 2->1 #1]
        Operation::Deliver { index: 2 },
        Operation::Deliver { index: 0 },
        Operation::Replay { index: 0 },
        Operation::DeliverAll,
    ];

    let results: Vec<_> = ops
        .iter()
        .map(|op| {
            let expected = model.apply(op);
            let actual = runtime.block_on(real.apply(op));
            assert_eq!(expected, actual, "{op:?}");
            actual
        })
        .collect();

    assert_eq!(results[2], OperationResult::Delivered(2, 0, vec![20, 21]));
    assert_eq!(results[3], OperationResult::Rejected(Rejection::Duplicate));
    assert_eq!(results[4], OperationResult::Rejected(Rejection::Replay));
}
