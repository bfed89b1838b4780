//! Multi-node key lifecycle tests over the in-memory peer store
//!
//! Run with: cargo test -p keysync-tests --test cluster_sync_test

mod common;

use async_trait::async_trait;
use common::NodeBuilder;
use futures::StreamExt;
use keysync_agent::TickReason;
use keysync_keys::KeyStorage;
use keysync_types::KeyPurpose;
use peer_store_client::{ClusterKeyStore, LeaderElection, MemoryClusterBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_forced_rotation_reaches_follower_within_one_cycle() {
    let backend = MemoryClusterBackend::new();
    let leader = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .token_expiration(-1)
        .attach(&backend)
        .await;
    let follower = NodeBuilder::new("keystone-1").attach(&backend).await;

    for round in 1..=5u64 {
        let state = leader.tick(TickReason::Scheduled).await;
        assert_eq!(state.last_error, None, "round {}", round);
        assert!(state.last_rotation.is_some());
        assert_eq!(state.published_revision, Some(round));
        assert_eq!(leader.rotator.calls(), round as usize);

        let tokens = leader.tokens().await;
        assert!(tokens.len() <= 3, "max_active_keys exceeded: {:?}", tokens);
        assert!(tokens.staging().is_some());

        let state = follower.tick(TickReason::PeerKeysChanged).await;
        assert!(state.ready);
        assert_eq!(follower.tokens().await, tokens);
        assert_eq!(follower.credentials().await, leader.credentials().await);
    }

    assert!(follower.storage.is_initialized().await.unwrap());
    assert_eq!(backend.last_writer().await.as_deref(), Some("keystone-0"));
}

#[tokio::test]
async fn test_follower_waits_for_first_publish() {
    let backend = MemoryClusterBackend::new();
    let follower = NodeBuilder::new("keystone-1").attach(&backend).await;

    let state = follower.tick(TickReason::Scheduled).await;

    assert!(!state.ready);
    assert_eq!(state.last_error, None);
    assert_eq!(follower.storage.physical_writes(), 0);
    assert!(!follower.storage.is_initialized().await.unwrap());
    assert!(follower.tokens().await.is_empty());
}

#[tokio::test]
async fn test_rotation_failure_keeps_snapshot_then_recovers() {
    let backend = MemoryClusterBackend::new();
    let leader = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .token_expiration(-1)
        .attach(&backend)
        .await;

    leader.tick(TickReason::Scheduled).await;
    let published = leader.store.read().await.unwrap();
    let revision = backend.revision().await;

    leader.rotator.set_failing(true);
    let state = leader.tick(TickReason::Scheduled).await;

    assert!(state.last_error.as_deref().unwrap_or_default().contains("rotation"));
    assert_eq!(leader.store.read().await.unwrap(), published);
    assert_eq!(backend.revision().await, revision);

    leader.rotator.set_failing(false);
    let state = leader.tick(TickReason::Scheduled).await;

    assert_eq!(state.last_error, None);
    assert_eq!(backend.revision().await, revision + 1);
    assert_ne!(leader.store.read().await.unwrap(), published);
}

#[tokio::test]
async fn test_quiet_leader_publishes_once() {
    let backend = MemoryClusterBackend::new();
    let leader = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .attach(&backend)
        .await;
    let mut changes = leader.store.watch();

    leader.tick(TickReason::ConfigChanged).await;
    leader.tick(TickReason::Scheduled).await;
    leader.tick(TickReason::Scheduled).await;

    assert_eq!(leader.rotator.calls(), 0);
    assert_eq!(backend.revision().await, 1);

    let first = timeout(Duration::from_secs(1), changes.next()).await.unwrap();
    assert!(matches!(first, Some(Ok(_))));
    // No notification for the unchanged publishes
    assert!(timeout(Duration::from_millis(100), changes.next()).await.is_err());
}

/// Leader at the start of the tick, revoked before the publish commits
struct RevokedMidTick {
    queries: AtomicUsize,
}

#[async_trait]
impl LeaderElection for RevokedMidTick {
    async fn is_leader(&self) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst) == 0
    }
}

#[tokio::test]
async fn test_revoked_leader_cannot_publish() {
    let backend = MemoryClusterBackend::new();
    let election = Arc::new(RevokedMidTick {
        queries: AtomicUsize::new(0),
    });
    let leader = NodeBuilder::new("keystone-0")
        .seeded()
        .election(election)
        .attach(&backend)
        .await;

    let state = leader.tick(TickReason::Scheduled).await;

    assert_eq!(state.is_leader, Some(true));
    let error = state.last_error.unwrap_or_default();
    assert!(error.contains("without holding leadership"), "{}", error);
    assert_eq!(backend.revision().await, 0);
    assert!(leader.store.read().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_two_leaders_are_refused() {
    let backend = MemoryClusterBackend::new();
    let first = NodeBuilder::new("keystone-0").leader().seeded().attach(&backend).await;
    let second = NodeBuilder::new("keystone-1").leader().seeded().attach(&backend).await;

    let state = first.tick(TickReason::Scheduled).await;

    assert!(state.last_error.unwrap_or_default().contains("Concurrent writer"));
    assert_eq!(backend.revision().await, 0);

    second.leadership.revoke();
    let state = first.tick(TickReason::Scheduled).await;
    assert_eq!(state.last_error, None);
    assert_eq!(backend.revision().await, 1);
}

#[tokio::test]
async fn test_leadership_handover() {
    let backend = MemoryClusterBackend::new();
    let old = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .token_expiration(-1)
        .attach(&backend)
        .await;
    let new = NodeBuilder::new("keystone-1")
        .token_expiration(-1)
        .attach(&backend)
        .await;

    old.tick(TickReason::Scheduled).await;
    new.tick(TickReason::PeerKeysChanged).await;
    assert_eq!(new.tokens().await, old.tokens().await);

    old.leadership.revoke();
    new.leadership.grant();

    let state = new.tick(TickReason::Scheduled).await;
    assert_eq!(state.last_error, None);
    assert_eq!(new.rotator.calls(), 1);
    assert_eq!(backend.last_writer().await.as_deref(), Some("keystone-1"));

    let state = old.tick(TickReason::PeerKeysChanged).await;
    assert_eq!(state.is_leader, Some(false));
    assert_eq!(old.tokens().await, new.tokens().await);

    let staging = old.tokens().await;
    let staging = staging.staging().unwrap();
    assert_eq!(staging.content, b"keystone-1-staging-1".to_vec());
}

#[tokio::test]
async fn test_follower_removes_keys_dropped_by_leader() {
    let backend = MemoryClusterBackend::new();
    let leader = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .token_expiration(-1)
        .attach(&backend)
        .await;
    let follower = NodeBuilder::new("keystone-1").attach(&backend).await;

    // Three rotations push the oldest primary out of the bounded set
    for _ in 0..3 {
        leader.tick(TickReason::Scheduled).await;
        follower.tick(TickReason::PeerKeysChanged).await;
    }

    let tokens = follower.tokens().await;
    assert_eq!(tokens.len(), 3);
    assert!(!tokens.contains(1));
    assert_eq!(
        follower
            .storage
            .read_all(KeyPurpose::TokenSigning)
            .await
            .unwrap()
            .indices()
            .collect::<Vec<_>>(),
        leader.tokens().await.indices().collect::<Vec<_>>()
    );
}
