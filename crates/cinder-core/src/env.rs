//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Prekey
//! rotation, archive expiry, certificate expiry and session timeouts all read
//! the clock through this trait, so a simulated clock can jump days ahead
//! without sleeping.

/// Abstract environment providing wall-clock time and randomness.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a simulated environment produces the same byte
///   sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time as Unix milliseconds.
    fn now_millis(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random fixed-size array, typically key seeds and nonces.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Generates a random `u32`.
    fn random_u32(&self) -> u32 {
        u32::from_be_bytes(self.random_array())
    }
}

/// Production environment using system time and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Key generation without functioning
/// randomness cannot be made secure, so there is no error path to recover
/// into.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

/// Deterministic environment for unit tests in this crate.
#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Seeded RNG plus a clock that only moves when told to.
    #[derive(Clone)]
    pub struct TestEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        now: Arc<AtomicU64>,
    }

    impl TestEnv {
        pub fn new(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                now: Arc::new(AtomicU64::new(1_700_000_000_000)),
            }
        }

        pub fn advance_millis(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }

        pub fn advance_days(&self, days: u64) {
            self.advance_millis(days * 24 * 60 * 60 * 1000);
        }
    }

    impl Environment for TestEnv {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().unwrap().fill_bytes(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();

        let bytes1: [u8; 32] = env.random_array();
        let bytes2: [u8; 32] = env.random_array();

        // Extremely unlikely to be equal if random
        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[test]
    fn system_env_clock_is_after_2020() {
        assert!(SystemEnv::new().now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_env_is_deterministic() {
        let a = test_env::TestEnv::new(7);
        let b = test_env::TestEnv::new(7);

        assert_eq!(a.random_array::<16>(), b.random_array::<16>());
        assert_eq!(a.random_u32(), b.random_u32());
    }

    #[test]
    fn test_env_clock_advances_only_on_demand() {
        let env = test_env::TestEnv::new(1);
        let start = env.now_millis();
        assert_eq!(env.now_millis(), start);

        env.advance_days(1);
        assert_eq!(env.now_millis() - start, 86_400_000);
    }
}
