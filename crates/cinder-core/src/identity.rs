//! Long-term device identity.

use cinder_crypto::{IdentityKey, IdentityKeyPair};
use serde::{Deserialize, Serialize};

use crate::{
    E2eeError,
    env::Environment,
    storage::{Storage, get_record, namespace, put_record},
};

/// Largest registration id handed out (14-bit space minus reserved values).
const MAX_REGISTRATION_ID: u32 = 16380;

const LOCAL_IDENTITY_KEY: &str = "local";

/// Source of the local identity key pair and registration id.
///
/// Account and device registration policy live outside this crate; anything
/// that can hand out these two values can back the managers.
pub trait IdentityManager: Send + Sync {
    /// Long-term identity key pair.
    fn identity_key_pair(&self) -> &IdentityKeyPair;

    /// Registration id published in prekey bundles.
    fn registration_id(&self) -> u32;

    /// Public half of the identity.
    fn identity_key(&self) -> IdentityKey {
        self.identity_key_pair().public_key()
    }
}

/// Identity generated and persisted on this device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalIdentity {
    key_pair: IdentityKeyPair,
    registration_id: u32,
}

impl LocalIdentity {
    /// Generate a fresh identity with a random registration id in
    /// `1..=16380`.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let key_pair = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let registration_id = env.random_u32() % MAX_REGISTRATION_ID + 1;

        Self { key_pair, registration_id }
    }

    /// Build from existing parts.
    pub fn from_parts(key_pair: IdentityKeyPair, registration_id: u32) -> Self {
        Self { key_pair, registration_id }
    }

    /// Load the persisted identity, generating and storing one on first run.
    pub async fn load_or_generate<S: Storage, E: Environment>(
        storage: &S,
        env: &E,
    ) -> Result<Self, E2eeError> {
        if let Some(identity) =
            get_record::<_, Self>(storage, namespace::IDENTITY, LOCAL_IDENTITY_KEY).await?
        {
            return Ok(identity);
        }

        let identity = Self::generate(env);
        put_record(storage, namespace::IDENTITY, LOCAL_IDENTITY_KEY, &identity).await?;

        tracing::info!(registration_id = identity.registration_id, "generated identity key pair");
        Ok(identity)
    }
}

impl IdentityManager for LocalIdentity {
    fn identity_key_pair(&self) -> &IdentityKeyPair {
        &self.key_pair
    }

    fn registration_id(&self) -> u32 {
        self.registration_id
    }
}
