//! Rotation churn across many followers
//!
//! A leader rotating on every tick while followers reconcile concurrently
//! must never leave a follower with a key set the leader did not publish.
//!
//! Run with: cargo test -p keysync-tests --test rotation_churn_test --release

#[path = "../integration/common.rs"]
mod common;

use common::{NodeBuilder, TestNode};
use futures::future::join_all;
use keysync_agent::TickReason;
use keysync_types::ClusterSnapshot;
use peer_store_client::{ClusterKeyStore, MemoryClusterBackend};
use std::time::Instant;

const FOLLOWERS: usize = 16;
const ROTATIONS: u64 = 25;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_converge_under_rotation_churn() {
    let backend = MemoryClusterBackend::new();
    let leader = NodeBuilder::new("keystone-0")
        .leader()
        .seeded()
        .token_expiration(-1)
        .attach(&backend)
        .await;

    let mut followers: Vec<TestNode> = Vec::with_capacity(FOLLOWERS);
    for i in 1..=FOLLOWERS {
        followers.push(NodeBuilder::new(&format!("keystone-{}", i)).attach(&backend).await);
    }

    let start = Instant::now();
    for _ in 0..ROTATIONS {
        let state = leader.tick(TickReason::Scheduled).await;
        assert_eq!(state.last_error, None);

        let states = join_all(
            followers
                .iter()
                .map(|follower| follower.tick(TickReason::PeerKeysChanged)),
        )
        .await;
        assert!(states.iter().all(|state| state.ready && state.last_error.is_none()));
    }
    let elapsed = start.elapsed();

    let published = leader.store.read().await.unwrap();
    for follower in &followers {
        let local = ClusterSnapshot::from_repositories([
            follower.tokens().await,
            follower.credentials().await,
        ]);
        assert_eq!(local, published, "{} diverged", follower.name);
    }

    assert_eq!(backend.revision().await, ROTATIONS);
    println!(
        "{} rotations reconciled by {} followers in {:?}",
        ROTATIONS, FOLLOWERS, elapsed
    );
}
