//! In-process walkthrough of the full protocol stack.
//!
//! Three devices on in-memory storage exchange sealed pairwise messages,
//! form a group over sender keys, and rotate the group key after a member
//! leaves. The transcript records what each step put on the wire.

use std::time::Duration;

use cinder_core::{
    CertificateAuthority, CertificateVerifier, CiphertextMessage, E2eeClient, E2eeConfig,
    Environment, MemoryStorage, PeerAddress, SenderCertificate, SystemEnv,
};
use cinder_crypto::SigningKeyPair;

use crate::CliError;

type DemoClient = E2eeClient<MemoryStorage, SystemEnv>;

const AUTHORITY_KEY_ID: u32 = 1;
const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(60 * 60);
const GROUP: &str = "demo-group";

struct Demo {
    env: SystemEnv,
    authority: CertificateAuthority,
    verifier: CertificateVerifier,
    transcript: Vec<String>,
}

impl Demo {
    fn certificate(&self, client: &DemoClient) -> Result<SenderCertificate, CliError> {
        let address = client.address();
        let expires_at = self.env.now_millis() + CERTIFICATE_LIFETIME.as_millis() as u64;
        Ok(self.authority.issue(
            &address.user_id,
            &address.device_id.to_string(),
            client.identity_key(),
            expires_at,
        )?)
    }

    /// Seal `text` from `from` to `to` and deliver it.
    async fn relay(
        &mut self,
        from: &DemoClient,
        to: &DemoClient,
        text: &str,
    ) -> Result<(), CliError> {
        let certificate = self.certificate(from)?;
        let envelope = from.send_sealed(to.address(), &certificate, text.as_bytes()).await?;
        let size = envelope.encode().len();

        let delivery = to.receive_sealed(&envelope, &self.verifier).await?;
        self.transcript.push(format!(
            "{} -> {}: {size}-byte envelope, {:?} inside, reads {:?}",
            from.address(),
            to.address(),
            delivery.message_type,
            String::from_utf8_lossy(&delivery.plaintext),
        ));
        Ok(())
    }

    /// X3DH from `a` to `b`, then one message each way.
    async fn connect(&mut self, a: &DemoClient, b: &DemoClient) -> Result<(), CliError> {
        let bundle = b.pre_key_bundle().await?;
        a.start_session(b.address(), &bundle).await?;
        self.transcript.push(format!(
            "{} fetched bundle of {} (signed prekey {}, one-time prekey {})",
            a.address(),
            b.address(),
            bundle.signed_pre_key_id,
            bundle.one_time_pre_key.map_or_else(|| "none".to_owned(), |(id, _)| id.to_string()),
        ));

        self.relay(a, b, &format!("hello {}", b.address().user_id)).await?;
        self.relay(b, a, &format!("hi {}", a.address().user_id)).await
    }

    /// Hand `from`'s sender key to every member.
    async fn distribute(
        &mut self,
        from: &DemoClient,
        members: &[&DemoClient],
    ) -> Result<(), CliError> {
        let addresses: Vec<PeerAddress> = members.iter().map(|m| m.address().clone()).collect();
        let messages = from.distribute_sender_key(GROUP, &addresses).await?;
        deliver_distributions(from, members, &messages).await?;

        let key_id = from.sender_keys().sender_key_id(GROUP).await?.unwrap_or_default();
        self.transcript.push(format!(
            "{} distributed sender key {key_id} to {} members",
            from.address(),
            messages.len()
        ));
        Ok(())
    }

    async fn group_send(
        &mut self,
        from: &DemoClient,
        members: &[&DemoClient],
        text: &str,
    ) -> Result<(), CliError> {
        let certificate = self.certificate(from)?;
        let addresses: Vec<PeerAddress> = members.iter().map(|m| m.address().clone()).collect();
        let envelopes =
            from.send_group_sealed(GROUP, &certificate, &addresses, text.as_bytes()).await?;

        for (address, envelope) in envelopes {
            let Some(member) = members.iter().find(|m| *m.address() == address) else {
                continue;
            };
            let delivery = member.receive_sealed(&envelope, &self.verifier).await?;
            self.transcript.push(format!(
                "{} => {}: group message reads {:?}",
                from.address(),
                address,
                String::from_utf8_lossy(&delivery.plaintext),
            ));
        }
        Ok(())
    }
}

async fn deliver_distributions(
    from: &DemoClient,
    members: &[&DemoClient],
    messages: &[(PeerAddress, CiphertextMessage)],
) -> Result<(), CliError> {
    for (address, message) in messages {
        if let Some(member) = members.iter().find(|m| m.address() == address) {
            member.receive_sender_key_distribution(from.address(), message).await?;
        }
    }
    Ok(())
}

async fn open(env: &SystemEnv, user: &str, config: &E2eeConfig) -> Result<DemoClient, CliError> {
    let address = PeerAddress::new(user, 1);
    let client = E2eeClient::open(MemoryStorage::new(), *env, address, config.clone()).await?;
    client.run_maintenance().await?;
    Ok(client)
}

/// Run the walkthrough and return its transcript.
pub async fn run_demo(config: &E2eeConfig) -> Result<Vec<String>, CliError> {
    let env = SystemEnv::new();
    let signing_key = SigningKeyPair::from_random(env.random_array());
    let authority = CertificateAuthority::new(signing_key, AUTHORITY_KEY_ID);
    let mut verifier = CertificateVerifier::new();
    verifier.trust(AUTHORITY_KEY_ID, *authority.public_key());
    let mut demo = Demo { env, authority, verifier, transcript: Vec::new() };

    let alice = open(&env, "alice", config).await?;
    let bob = open(&env, "bob", config).await?;
    let carol = open(&env, "carol", config).await?;
    demo.transcript.push(format!(
        "opened alice, bob and carol with {} one-time prekeys each",
        config.prekeys.one_time_batch_size
    ));

    demo.connect(&alice, &bob).await?;
    demo.connect(&alice, &carol).await?;
    demo.connect(&bob, &carol).await?;

    demo.distribute(&alice, &[&bob, &carol]).await?;
    demo.distribute(&bob, &[&alice, &carol]).await?;
    demo.distribute(&carol, &[&alice, &bob]).await?;
    demo.group_send(&alice, &[&bob, &carol], "welcome to the group").await?;
    demo.group_send(&carol, &[&alice, &bob], "glad to be here").await?;

    // Carol leaves: remaining senders drop her key and rotate their own
    let messages = alice.remove_group_member(GROUP, "carol", &[bob.address().clone()]).await?;
    deliver_distributions(&alice, &[&bob], &messages).await?;
    let messages = bob.remove_group_member(GROUP, "carol", &[alice.address().clone()]).await?;
    deliver_distributions(&bob, &[&alice], &messages).await?;
    demo.transcript.push("carol left; alice and bob rotated their sender keys".to_owned());

    demo.group_send(&alice, &[&bob], "just the two of us").await?;
    demo.relay(&bob, &alice, "pairwise still works").await?;

    for client in [&alice, &bob, &carol] {
        let peers = client.sessions().peers().await?.len();
        demo.transcript.push(format!("{} holds {peers} sessions", client.address()));
    }
    Ok(demo.transcript)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_runs_end_to_end() {
        let mut config = E2eeConfig::default();
        config.prekeys.one_time_batch_size = 4;

        let transcript = run_demo(&config).await.unwrap();

        assert!(transcript[0].contains("4 one-time prekeys"));
        assert!(transcript.iter().any(|line| line.contains("\"hello bob\"")));
        assert!(transcript.iter().any(|line| line.contains("\"welcome to the group\"")));
        assert!(transcript.iter().any(|line| line.contains("\"just the two of us\"")));
        assert!(transcript.last().unwrap().ends_with("holds 2 sessions"));
    }
}
