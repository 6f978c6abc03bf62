//! Simulated environment: seeded randomness and a clock that only moves
//! when told to.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cinder_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// 2023-11-14T22:13:20Z, an arbitrary fixed epoch for simulations.
pub const SIM_START_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic [`Environment`].
///
/// Clones share the RNG and the clock, so every device in one simulation
/// sees the same time and one reproducible random stream.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
    now: Arc<AtomicU64>,
}

impl SimEnv {
    /// Environment seeded with `seed`, clock at [`SIM_START_MILLIS`].
    pub fn with_seed(seed: u64) -> Self {
        Self::with_start(seed, SIM_START_MILLIS)
    }

    /// Environment seeded with `seed`, clock at `start_millis`.
    pub fn with_start(seed: u64, start_millis: u64) -> Self {
        Self {
            seed,
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Seed this environment was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Move the clock forward by whole days.
    pub fn advance_days(&self, days: u64) {
        self.advance(Duration::from_secs(days * 24 * 60 * 60));
    }

    /// Set the clock. Going backwards is allowed, for clock-skew tests.
    pub fn set_time(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("invariant: RNG mutex not poisoned").fill_bytes(buffer);
    }
}
