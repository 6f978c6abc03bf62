//! Tunables for prekey lifecycle, session bounds and sender-key rotation.
//!
//! Every field has a default, so an empty TOML document (or a partial one)
//! deserializes to a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for the encryption core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// Signed and one-time prekey lifecycle
    pub prekeys: PreKeyConfig,
    /// Pairwise session bounds
    pub sessions: SessionConfig,
    /// Group sender-key policy
    pub sender_keys: SenderKeyConfig,
}

/// Signed prekey rotation and archive retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// Age at which the current signed prekey should be rotated
    pub rotation_interval_secs: u64,
    /// How long a superseded signed prekey stays retrievable
    pub archive_retention_secs: u64,
    /// Number of one-time prekeys generated per batch
    pub one_time_batch_size: u32,
}

impl PreKeyConfig {
    /// Rotation interval as a `Duration`.
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Archive retention as a `Duration`.
    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_secs)
    }
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 7 * DAY_SECS,
            archive_retention_secs: 30 * DAY_SECS,
            one_time_batch_size: 100,
        }
    }
}

/// Double Ratchet bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Skipped-key cache capacity; the oldest entry is evicted beyond this
    pub max_skipped_message_keys: usize,
    /// Largest counter jump a single incoming message may force
    pub max_forward_jump: u32,
    /// Sessions idle longer than this are pruned by
    /// `cleanup_expired_sessions`
    pub session_timeout_secs: u64,
}

impl SessionConfig {
    /// Session timeout as a `Duration`.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_message_keys: 1000,
            max_forward_jump: 2000,
            session_timeout_secs: 30 * DAY_SECS,
        }
    }
}

/// Sender-key rotation and catch-up bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderKeyConfig {
    /// Iteration at which a rotation warning is logged
    pub rotation_threshold: u32,
    /// How far ahead of the stored iteration an incoming message may be
    pub max_future_iterations: u32,
}

impl Default for SenderKeyConfig {
    fn default() -> Self {
        Self { rotation_threshold: 1000, max_future_iterations: 2000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = E2eeConfig::default();

        assert_eq!(config.prekeys.rotation_interval(), Duration::from_secs(604_800));
        assert_eq!(config.prekeys.archive_retention(), Duration::from_secs(2_592_000));
        assert_eq!(config.sessions.max_skipped_message_keys, 1000);
        assert_eq!(config.sessions.max_forward_jump, 2000);
        assert_eq!(config.sender_keys.rotation_threshold, 1000);
        assert_eq!(config.sender_keys.max_future_iterations, 2000);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let value = ciborium::Value::Map(vec![(
            ciborium::Value::Text("sender_keys".into()),
            ciborium::Value::Map(vec![(
                ciborium::Value::Text("rotation_threshold".into()),
                ciborium::Value::Integer(50.into()),
            )]),
        )]);

        let config: E2eeConfig = value.deserialized().unwrap();

        assert_eq!(config.sender_keys.rotation_threshold, 50);
        assert_eq!(config.sender_keys.max_future_iterations, 2000);
        assert_eq!(config.prekeys, PreKeyConfig::default());
    }
}
