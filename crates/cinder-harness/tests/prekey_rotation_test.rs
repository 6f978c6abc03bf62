//! Signed prekey rotation and archive retention over simulated weeks.

use cinder_core::{E2eeClient, E2eeConfig, E2eeError, MemoryStorage, PeerAddress};
use cinder_harness::SimEnv;

type Client = E2eeClient<MemoryStorage, SimEnv>;

async fn open(env: &SimEnv, user: &str) -> Client {
    let address = PeerAddress::new(user, 1);
    E2eeClient::open(MemoryStorage::new(), env.clone(), address, E2eeConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn rotates_after_seven_days() {
    let env = SimEnv::with_seed(1);
    let bob = open(&env, "bob").await;
    let original = bob.prekeys().current_signed_pre_key().await.unwrap();

    env.advance_days(6);
    assert!(!bob.prekeys().needs_rotation().await.unwrap());
    assert!(bob.prekeys().rotate_if_needed().await.unwrap().is_none());

    env.advance_days(1);
    assert!(bob.prekeys().needs_rotation().await.unwrap());
    let rotated = bob.prekeys().rotate_if_needed().await.unwrap().unwrap();
    assert_ne!(rotated.key_id(), original.key_id());
    rotated.verify(&bob.identity_key()).unwrap();

    assert_eq!(bob.prekeys().current_signed_pre_key().await.unwrap().key_id(), rotated.key_id());
    assert!(!bob.prekeys().needs_rotation().await.unwrap());
}

#[tokio::test]
async fn stale_bundle_works_while_archived() {
    let env = SimEnv::with_seed(2);
    let alice = open(&env, "alice").await;
    let bob = open(&env, "bob").await;

    let stale_bundle = bob.pre_key_bundle().await.unwrap();
    env.advance_days(8);
    bob.run_maintenance().await.unwrap();
    let fresh_bundle = bob.pre_key_bundle().await.unwrap();
    assert_ne!(fresh_bundle.signed_pre_key_id, stale_bundle.signed_pre_key_id);

    alice.start_session(bob.address(), &stale_bundle).await.unwrap();
    let hello = alice.sessions().encrypt(bob.address(), b"from an old bundle").await.unwrap();
    assert_eq!(
        bob.sessions().decrypt(alice.address(), &hello).await.unwrap(),
        b"from an old bundle"
    );
}

#[tokio::test]
async fn archived_key_expires_after_thirty_days() {
    let env = SimEnv::with_seed(3);
    let alice = open(&env, "alice").await;
    let bob = open(&env, "bob").await;

    let stale_bundle = bob.pre_key_bundle().await.unwrap();
    let stale_id = stale_bundle.signed_pre_key_id;

    env.advance_days(7);
    bob.prekeys().rotate_if_needed().await.unwrap().unwrap();

    env.advance_days(29);
    assert!(bob.prekeys().signed_pre_key(stale_id).await.unwrap().is_some());

    env.advance_days(1);
    assert!(bob.prekeys().signed_pre_key(stale_id).await.unwrap().is_none());

    alice.start_session(bob.address(), &stale_bundle).await.unwrap();
    let hello = alice.sessions().encrypt(bob.address(), b"too late").await.unwrap();
    assert_eq!(
        bob.sessions().decrypt(alice.address(), &hello).await.unwrap_err(),
        E2eeError::KeyNotFound
    );
    assert!(!bob.sessions().has_session(alice.address()).await.unwrap());
}

#[tokio::test]
async fn weekly_maintenance_keeps_bundles_fresh() {
    let env = SimEnv::with_seed(4);
    let bob = open(&env, "bob").await;

    let mut ids = vec![bob.pre_key_bundle().await.unwrap().signed_pre_key_id];
    for _ in 0..6 {
        env.advance_days(7);
        let report = bob.run_maintenance().await.unwrap();
        assert!(report.rotated_signed_pre_key);
        ids.push(bob.pre_key_bundle().await.unwrap().signed_pre_key_id);
    }

    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    // Only keys archived within the last 30 days are still served
    let served: Vec<bool> = {
        let mut served = Vec::new();
        for id in &ids {
            served.push(bob.prekeys().signed_pre_key(*id).await.unwrap().is_some());
        }
        served
    };
    assert_eq!(served, vec![false, true, true, true, true, true, true]);
}
