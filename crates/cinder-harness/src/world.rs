//! Multi-device simulation over an in-memory "network".
//!
//! Every device is a full [`E2eeClient`] with its own storage. Sealed
//! envelopes are queued in flight and delivered one at a time, in whatever
//! order a test chooses, which is how out-of-order delivery, replay and
//! certificate expiry are exercised.

use std::time::Duration;

use cinder_core::{
    CertificateAuthority, CertificateVerifier, Delivery, E2eeClient, E2eeConfig, E2eeError,
    Environment, MemoryStorage, PeerAddress, SealedSenderEnvelope, SenderCertificate,
};
use cinder_crypto::SigningKeyPair;

use crate::sim_env::SimEnv;

/// Client type used by [`SimWorld`].
pub type SimClient = E2eeClient<MemoryStorage, SimEnv>;

/// Validity of certificates issued by the simulated authority.
pub const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Key id of the simulated certificate authority.
pub const AUTHORITY_KEY_ID: u32 = 1;

/// One-time prekeys each device starts with.
const INITIAL_ONE_TIME_PRE_KEYS: u32 = 10;

/// Envelope queued between two devices.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Sending device index
    pub from: usize,
    /// Receiving device index
    pub to: usize,
    /// Sealed message
    pub envelope: SealedSenderEnvelope,
}

/// Devices, a certificate authority and the envelopes between them.
pub struct SimWorld {
    env: SimEnv,
    authority: CertificateAuthority,
    verifier: CertificateVerifier,
    devices: Vec<SimClient>,
    in_flight: Vec<InFlight>,
    delivered: Vec<InFlight>,
}

impl SimWorld {
    /// Empty world seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        let env = SimEnv::with_seed(seed);
        let authority = CertificateAuthority::new(
            SigningKeyPair::from_random(env.random_array()),
            AUTHORITY_KEY_ID,
        );
        let mut verifier = CertificateVerifier::new();
        verifier.trust(AUTHORITY_KEY_ID, *authority.public_key());

        Self {
            env,
            authority,
            verifier,
            devices: Vec::new(),
            in_flight: Vec::new(),
            delivered: Vec::new(),
        }
    }

    /// World with `count` devices named `user0`, `user1`, ...
    pub async fn with_devices(seed: u64, count: usize) -> Result<Self, E2eeError> {
        let mut world = Self::new(seed);
        for i in 0..count {
            world.add_device(&format!("user{i}")).await?;
        }
        Ok(world)
    }

    /// Add device 1 of `user_id`. Returns its index.
    pub async fn add_device(&mut self, user_id: &str) -> Result<usize, E2eeError> {
        let client = E2eeClient::open(
            MemoryStorage::new(),
            self.env.clone(),
            PeerAddress::new(user_id, 1),
            E2eeConfig::default(),
        )
        .await?;
        client.prekeys().generate_one_time_pre_keys(INITIAL_ONE_TIME_PRE_KEYS).await?;

        self.devices.push(client);
        Ok(self.devices.len() - 1)
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Verifier trusting the simulated authority.
    pub fn verifier(&self) -> &CertificateVerifier {
        &self.verifier
    }

    /// Simulated authority.
    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    /// Device by index.
    pub fn device(&self, index: usize) -> &SimClient {
        &self.devices[index]
    }

    /// Every device, by index.
    pub fn devices(&self) -> &[SimClient] {
        &self.devices
    }

    /// Address of the device at `index`.
    pub fn address(&self, index: usize) -> PeerAddress {
        self.devices[index].address().clone()
    }

    /// Fresh certificate for the device at `index`, valid for
    /// [`CERTIFICATE_LIFETIME`].
    pub fn certificate(&self, index: usize) -> Result<SenderCertificate, E2eeError> {
        let device = &self.devices[index];
        self.authority.issue(
            &device.address().user_id,
            &device.address().device_id.to_string(),
            device.identity_key(),
            self.env.now_millis() + CERTIFICATE_LIFETIME.as_millis() as u64,
        )
    }

    /// Establish a session between `a` and `b` in both directions: `a`
    /// initiates, sends a handshake message, and `b` replies.
    pub async fn handshake(&mut self, a: usize, b: usize) -> Result<(), E2eeError> {
        let bundle = self.devices[b].pre_key_bundle().await?;
        self.devices[a].start_session(&self.address(b), &bundle).await?;

        self.send(a, b, b"").await?;
        self.deliver_last().await?;
        self.send(b, a, b"").await?;
        self.deliver_last().await?;
        Ok(())
    }

    /// Handshake every pair of devices.
    pub async fn connect_all(&mut self) -> Result<(), E2eeError> {
        for a in 0..self.devices.len() {
            for b in (a + 1)..self.devices.len() {
                self.handshake(a, b).await?;
            }
        }
        Ok(())
    }

    /// Seal `plaintext` from `from` to `to` and queue it.
    pub async fn send(
        &mut self,
        from: usize,
        to: usize,
        plaintext: &[u8],
    ) -> Result<(), E2eeError> {
        let certificate = self.certificate(from)?;
        let envelope =
            self.devices[from].send_sealed(&self.address(to), &certificate, plaintext).await?;
        self.in_flight.push(InFlight { from, to, envelope });
        Ok(())
    }

    /// Every device sends its sender key for `group_id` to every other
    /// device. Requires [`connect_all`](Self::connect_all).
    pub async fn setup_group(&mut self, group_id: &str) -> Result<(), E2eeError> {
        for from in 0..self.devices.len() {
            let members = self.others(from);
            let messages = self.devices[from].distribute_sender_key(group_id, &members).await?;

            let sender = self.address(from);
            for (member, message) in messages {
                let Some(to) = self.index_of(&member) else {
                    continue;
                };
                self.devices[to].receive_sender_key_distribution(&sender, &message).await?;
            }
        }
        Ok(())
    }

    /// Encrypt once for `group_id` and queue a sealed copy for every other
    /// device.
    pub async fn send_group(
        &mut self,
        from: usize,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<(), E2eeError> {
        let certificate = self.certificate(from)?;
        let members = self.others(from);
        let envelopes = self.devices[from]
            .send_group_sealed(group_id, &certificate, &members, plaintext)
            .await?;

        for (member, envelope) in envelopes {
            if let Some(to) = self.index_of(&member) {
                self.in_flight.push(InFlight { from, to, envelope });
            }
        }
        Ok(())
    }

    /// Envelopes not yet delivered, in send order.
    pub fn in_flight(&self) -> &[InFlight] {
        &self.in_flight
    }

    /// Envelopes delivered successfully, in delivery order.
    pub fn delivered(&self) -> &[InFlight] {
        &self.delivered
    }

    /// Deliver the in-flight envelope at `index`.
    ///
    /// The envelope leaves the queue whether or not the recipient accepts it.
    pub async fn deliver(&mut self, index: usize) -> (InFlight, Result<Delivery, E2eeError>) {
        let message = self.in_flight.remove(index);
        let result =
            self.devices[message.to].receive_sealed(&message.envelope, &self.verifier).await;
        if result.is_ok() {
            self.delivered.push(message.clone());
        } else {
            tracing::debug!(from = message.from, to = message.to, "delivery rejected");
        }
        (message, result)
    }

    /// Deliver the most recently sent envelope.
    pub async fn deliver_last(&mut self) -> Result<Delivery, E2eeError> {
        let Some(last) = self.in_flight.len().checked_sub(1) else {
            return Err(E2eeError::InvalidMessage);
        };
        self.deliver(last).await.1
    }

    /// Deliver everything in flight, oldest first.
    pub async fn deliver_all(&mut self) -> Vec<(InFlight, Result<Delivery, E2eeError>)> {
        let mut results = Vec::with_capacity(self.in_flight.len());
        while !self.in_flight.is_empty() {
            results.push(self.deliver(0).await);
        }
        results
    }

    /// Deliver an already delivered envelope again.
    pub async fn replay(&self, index: usize) -> Result<Delivery, E2eeError> {
        let message = &self.delivered[index];
        self.devices[message.to].receive_sealed(&message.envelope, &self.verifier).await
    }

    fn others(&self, index: usize) -> Vec<PeerAddress> {
        (0..self.devices.len()).filter(|&i| i != index).map(|i| self.address(i)).collect()
    }

    fn index_of(&self, address: &PeerAddress) -> Option<usize> {
        self.devices.iter().position(|device| device.address() == address)
    }
}
