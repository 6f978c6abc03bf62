//! Sealed sender across simulated devices: delivery order, expiry and
//! certificate trust.

use cinder_core::{
    CertificateVerifier, E2eeError, MessageType, SealedSenderEnvelope, sealed_sender,
};
use cinder_harness::{CERTIFICATE_LIFETIME, SimWorld};

#[tokio::test]
async fn reordered_delivery_recovers_every_message() {
    let mut world = SimWorld::with_devices(1, 2).await.unwrap();
    world.connect_all().await.unwrap();

    for i in 0..10u8 {
        world.send(0, 1, &[i]).await.unwrap();
    }

    // Newest first
    for expected in (0..10u8).rev() {
        let newest = world.in_flight().len() - 1;
        let (_, result) = world.deliver(newest).await;
        let delivery = result.unwrap();
        assert_eq!(delivery.plaintext, vec![expected]);
        assert_eq!(delivery.sender, world.address(0));
        assert_eq!(delivery.message_type, MessageType::Ratchet);
    }
}

#[tokio::test]
async fn transport_sees_only_the_envelope() {
    let mut world = SimWorld::with_devices(2, 2).await.unwrap();
    world.connect_all().await.unwrap();
    world.send(0, 1, b"secret").await.unwrap();

    let envelope = &world.in_flight()[0].envelope;
    let sender_identity = world.device(0).identity_key().encode();
    let bytes = envelope.encode();
    assert!(!bytes.windows(sender_identity.len()).any(|window| window == sender_identity));
    assert!(!bytes.windows(6).any(|window| window == b"secret"));
    let wire = envelope.to_base64();

    // Only the recipient's identity opens it
    let outsider = cinder_crypto::IdentityKeyPair::from_random([7; 32], [8; 32]);
    let parsed = SealedSenderEnvelope::from_base64(&wire).unwrap();
    assert_eq!(
        sealed_sender::unseal(&parsed, &outsider, |_| true, world.env()).unwrap_err(),
        E2eeError::DecryptionFailed
    );
}

#[tokio::test]
async fn certificate_expires_in_flight() {
    let mut world = SimWorld::with_devices(3, 2).await.unwrap();
    world.connect_all().await.unwrap();

    world.send(0, 1, b"slow").await.unwrap();
    world.env().advance(CERTIFICATE_LIFETIME);
    world.send(0, 1, b"fast").await.unwrap();
    world.env().advance(std::time::Duration::from_millis(1));

    let results = world.deliver_all().await;
    assert_eq!(results[0].1.as_ref().unwrap_err(), &E2eeError::InvalidCertificate);
    assert_eq!(results[1].1.as_ref().unwrap().plaintext, b"fast");
}

#[tokio::test]
async fn revoked_authority_key_rejects() {
    let mut world = SimWorld::with_devices(4, 2).await.unwrap();
    world.connect_all().await.unwrap();
    world.send(1, 0, b"hi").await.unwrap();

    let envelope = world.in_flight()[0].envelope.clone();
    let mut verifier = world.verifier().clone();
    verifier.revoke(cinder_harness::world::AUTHORITY_KEY_ID);

    assert_eq!(
        world.device(0).receive_sealed(&envelope, &verifier).await.unwrap_err(),
        E2eeError::InvalidCertificate
    );
    assert_eq!(
        world.device(0).receive_sealed(&envelope, &CertificateVerifier::new()).await.unwrap_err(),
        E2eeError::InvalidCertificate
    );

    // The rejected attempts consumed nothing
    assert_eq!(world.deliver_last().await.unwrap().plaintext, b"hi");
}

#[tokio::test]
async fn replay_is_rejected() {
    let mut world = SimWorld::with_devices(5, 2).await.unwrap();
    world.connect_all().await.unwrap();

    world.send(0, 1, b"once").await.unwrap();
    world.deliver_last().await.unwrap();

    let last = world.delivered().len() - 1;
    assert_eq!(world.replay(last).await.unwrap_err(), E2eeError::DuplicateMessage);
}

#[tokio::test]
async fn first_contact_is_sealed_pre_key_message() {
    let mut world = SimWorld::with_devices(6, 2).await.unwrap();
    let bundle = world.device(1).pre_key_bundle().await.unwrap();
    world.device(0).start_session(&world.address(1), &bundle).await.unwrap();

    world.send(0, 1, b"first contact").await.unwrap();
    let delivery = world.deliver_last().await.unwrap();
    assert_eq!(delivery.message_type, MessageType::PreKey);
    assert_eq!(delivery.plaintext, b"first contact");

    let remote = world.device(1).sessions().remote_identity(&world.address(0)).await.unwrap();
    assert_eq!(remote, Some(world.device(0).identity_key()));
}
