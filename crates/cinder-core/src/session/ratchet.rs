//! Double Ratchet transitions on [`SessionState`].
//!
//! Every function here mutates the state it is given. The session manager
//! calls them on a copy and only commits the copy once the operation (and
//! the write to storage) succeeded.

use cinder_crypto::{KeyPair, PublicKey, Secret, SymmetricRatchet, aead, kdf};

use super::{
    message::RatchetMessage,
    state::{RETIRED_RATCHET_KEYS, SessionState, SkippedMessageKey},
};
use crate::{E2eeError, config::SessionConfig, env::Environment};

enum Direction {
    Outgoing,
    Incoming,
}

impl SessionState {
    /// Encrypt `plaintext` on the sending chain.
    ///
    /// Without a sending chain (responder before its first reply) this first
    /// performs the sending half of a DH ratchet step.
    pub(crate) fn encrypt<E: Environment>(
        &mut self,
        plaintext: &[u8],
        env: &E,
    ) -> Result<RatchetMessage, E2eeError> {
        if self.sending_chain_key.is_none() {
            self.ratchet_sending_chain(env)?;
        }
        let (Some(chain_key), Some(ratchet_key)) =
            (&self.sending_chain_key, &self.sending_ratchet_key)
        else {
            return Err(E2eeError::NoSession);
        };

        let mut ratchet = SymmetricRatchet::new(chain_key.clone(), self.sending_message_number);
        let message_key = ratchet.advance()?;

        let mut message = RatchetMessage {
            ratchet_key: *ratchet_key.public_key(),
            counter: message_key.counter(),
            previous_counter: self.previous_chain_length,
            ciphertext: Vec::new(),
        };

        let (chain_key, counter) = ratchet.into_parts();
        self.sending_chain_key = Some(chain_key);
        self.sending_message_number = counter;

        let aad = self.associated_data(&message, &Direction::Outgoing);
        message.ciphertext = aead::encrypt(message_key.key(), env.random_array(), plaintext, &aad);

        self.last_activity_at = env.now_millis();
        Ok(message)
    }

    /// Decrypt a message, ratcheting as needed.
    ///
    /// # Errors
    ///
    /// - `DuplicateMessage`: counter already consumed on this chain, or the
    ///   message belongs to a retired chain and its key is not cached
    /// - `OutdatedMessage`: the message would skip more than
    ///   `max_forward_jump` keys
    /// - `DecryptionFailed`: AEAD rejected the ciphertext
    pub(crate) fn decrypt<E: Environment>(
        &mut self,
        message: &RatchetMessage,
        config: &SessionConfig,
        env: &E,
    ) -> Result<Vec<u8>, E2eeError> {
        if let Some(message_key) = self.take_skipped_key(&message.ratchet_key, message.counter) {
            let plaintext = self.open(message, &message_key)?;
            self.last_activity_at = env.now_millis();
            return Ok(plaintext);
        }

        if self.receiving_ratchet_key != Some(message.ratchet_key) {
            if self.retired_ratchet_keys.contains(&message.ratchet_key) {
                tracing::debug!(
                    counter = message.counter,
                    "message from retired chain without cached key"
                );
                return Err(E2eeError::DuplicateMessage);
            }

            self.skip_message_keys(message.previous_counter, config)?;
            self.ratchet_receiving_chain(message.ratchet_key)?;
            self.ratchet_sending_chain(env)?;
        }

        if message.counter < self.receiving_message_number {
            tracing::debug!(
                counter = message.counter,
                expected = self.receiving_message_number,
                "replayed session message"
            );
            return Err(E2eeError::DuplicateMessage);
        }

        self.skip_message_keys(message.counter, config)?;

        let Some(chain_key) = &self.receiving_chain_key else {
            return Err(E2eeError::NoSession);
        };
        let mut ratchet = SymmetricRatchet::new(chain_key.clone(), self.receiving_message_number);
        let message_key = ratchet.advance()?;

        let (chain_key, counter) = ratchet.into_parts();
        self.receiving_chain_key = Some(chain_key);
        self.receiving_message_number = counter;

        let plaintext = self.open(message, message_key.key())?;
        self.last_activity_at = env.now_millis();
        Ok(plaintext)
    }

    /// Sending half of a DH ratchet step against the peer's current ratchet
    /// key.
    fn ratchet_sending_chain<E: Environment>(&mut self, env: &E) -> Result<(), E2eeError> {
        let Some(their_ratchet_key) = self.receiving_ratchet_key else {
            return Err(E2eeError::NoSession);
        };

        let ours = KeyPair::from_random(env.random_array());
        let shared = ours.diffie_hellman(&their_ratchet_key)?;
        let (root_key, chain_key) = kdf::derive_root_step(&self.root_key, &shared);

        self.root_key = root_key;
        self.sending_chain_key = Some(chain_key);
        self.sending_ratchet_key = Some(ours);
        self.previous_chain_length = self.sending_message_number;
        self.sending_message_number = 0;
        Ok(())
    }

    /// Receiving half of a DH ratchet step for a new peer ratchet key.
    fn ratchet_receiving_chain(&mut self, their_ratchet_key: PublicKey) -> Result<(), E2eeError> {
        let Some(ours) = &self.sending_ratchet_key else {
            tracing::debug!("new ratchet key before any local ratchet key exists");
            return Err(E2eeError::DecryptionFailed);
        };

        let shared = ours.diffie_hellman(&their_ratchet_key)?;
        let (root_key, chain_key) = kdf::derive_root_step(&self.root_key, &shared);

        if let Some(previous) = self.receiving_ratchet_key.replace(their_ratchet_key) {
            self.retired_ratchet_keys.push_back(previous);
            if self.retired_ratchet_keys.len() > RETIRED_RATCHET_KEYS {
                self.retired_ratchet_keys.pop_front();
            }
        }

        self.root_key = root_key;
        self.receiving_chain_key = Some(chain_key);
        self.receiving_message_number = 0;
        Ok(())
    }

    /// Advance the receiving chain to `until`, caching every intermediate
    /// key. Oldest cached keys are evicted beyond the configured capacity.
    fn skip_message_keys(&mut self, until: u32, config: &SessionConfig) -> Result<(), E2eeError> {
        let (Some(chain_key), Some(ratchet_key)) =
            (&self.receiving_chain_key, self.receiving_ratchet_key)
        else {
            return Ok(());
        };
        if until <= self.receiving_message_number {
            return Ok(());
        }
        if until - self.receiving_message_number > config.max_forward_jump {
            tracing::debug!(
                current = self.receiving_message_number,
                requested = until,
                "session message too far ahead"
            );
            return Err(E2eeError::OutdatedMessage);
        }

        let mut ratchet = SymmetricRatchet::new(chain_key.clone(), self.receiving_message_number);
        let skipped = ratchet.skip_to(until, config.max_forward_jump)?;

        for key in skipped {
            let (message_key, counter) = key.into_parts();
            self.skipped_message_keys.push_back(SkippedMessageKey {
                ratchet_key,
                counter,
                message_key,
            });
        }

        let overflow =
            self.skipped_message_keys.len().saturating_sub(config.max_skipped_message_keys);
        if overflow > 0 {
            self.skipped_message_keys.drain(..overflow);
            tracing::debug!(evicted = overflow, "skipped message key cache full");
        }

        let (chain_key, counter) = ratchet.into_parts();
        self.receiving_chain_key = Some(chain_key);
        self.receiving_message_number = counter;
        Ok(())
    }

    /// Remove and return a cached key.
    fn take_skipped_key(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<Secret<32>> {
        let index = self
            .skipped_message_keys
            .iter()
            .position(|entry| entry.ratchet_key == *ratchet_key && entry.counter == counter)?;
        self.skipped_message_keys.remove(index).map(|entry| entry.message_key)
    }

    fn open(&self, message: &RatchetMessage, key: &Secret<32>) -> Result<Vec<u8>, E2eeError> {
        let aad = self.associated_data(message, &Direction::Incoming);
        aead::decrypt(key, &message.ciphertext, &aad).map_err(|err| {
            tracing::debug!(error = %err, counter = message.counter, "session message rejected");
            E2eeError::DecryptionFailed
        })
    }

    /// `header ‖ sender identity ‖ receiver identity`
    fn associated_data(&self, message: &RatchetMessage, direction: &Direction) -> Vec<u8> {
        let (sender, receiver) = match direction {
            Direction::Outgoing => (&self.local_identity_key, &self.remote_identity_key),
            Direction::Incoming => (&self.remote_identity_key, &self.local_identity_key),
        };

        let mut aad = message.header();
        aad.extend_from_slice(&sender.encode());
        aad.extend_from_slice(&receiver.encode());
        aad
    }
}
