//! Traits for peer store operations

use async_trait::async_trait;
use futures::Stream;
use keysync_types::ClusterSnapshot;
use std::pin::Pin;

use crate::error::SyncError;

/// Result of a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The proposed snapshot equals the published one; nothing was written
    Unchanged,
    /// The snapshot replaced the published one and followers were notified
    Published { revision: u64 },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Stream of snapshots published after the watch started
pub type SnapshotStream<'a> =
    Pin<Box<dyn Stream<Item = Result<ClusterSnapshot, SyncError>> + Send + 'a>>;

/// Cluster-wide key snapshot store: single writer (the leader), many readers
#[async_trait]
pub trait ClusterKeyStore: Send + Sync {
    /// Publish a snapshot (leader only).
    ///
    /// Equal snapshots are a no-op and raise no notification. A caller that
    /// does not hold leadership at commit time gets `SyncError::NotLeader`.
    async fn publish(&self, snapshot: &ClusterSnapshot) -> Result<PublishOutcome, SyncError>;

    /// Read the last published snapshot, or an empty one
    async fn read(&self) -> Result<ClusterSnapshot, SyncError>;

    /// Change notifications for every node, the publisher included
    fn watch(&self) -> SnapshotStream<'_>;

    /// Get the store type name
    fn store_type(&self) -> &str;
}
