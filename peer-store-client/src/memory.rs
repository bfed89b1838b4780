//! In-process peer store
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use async_trait::async_trait;
use keysync_types::ClusterSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info};

use crate::error::{Result, SyncError};
use crate::leadership::LeaderElection;
use crate::traits::{ClusterKeyStore, PublishOutcome, SnapshotStream};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct PublishedState {
    snapshot: ClusterSnapshot,
    revision: u64,
    writer: Option<String>,
}

/// Shared state behind every [`MemoryClusterStore`] handle.
///
/// One backend stands in for the cluster; each node attaches its own handle
/// together with its leadership query. Publishing asserts that no other
/// attached node claims leadership at the same time.
pub struct MemoryClusterBackend {
    state: RwLock<PublishedState>,
    nodes: RwLock<HashMap<String, Arc<dyn LeaderElection>>>,
    changes: broadcast::Sender<ClusterSnapshot>,
}

impl MemoryClusterBackend {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(PublishedState::default()),
            nodes: RwLock::new(HashMap::new()),
            changes,
        })
    }

    /// Register a node and get its store handle
    pub async fn attach(
        self: &Arc<Self>,
        node_id: impl Into<String>,
        leadership: Arc<dyn LeaderElection>,
    ) -> MemoryClusterStore {
        let node_id = node_id.into();
        self.nodes
            .write()
            .await
            .insert(node_id.clone(), Arc::clone(&leadership));

        debug!(node_id = %node_id, "Node attached to in-memory peer store");

        MemoryClusterStore {
            node_id,
            backend: Arc::clone(self),
            leadership,
        }
    }

    /// Number of effective publishes so far
    pub async fn revision(&self) -> u64 {
        self.state.read().await.revision
    }

    /// Node that performed the last effective publish
    pub async fn last_writer(&self) -> Option<String> {
        self.state.read().await.writer.clone()
    }
}

/// One node's handle on a [`MemoryClusterBackend`]
pub struct MemoryClusterStore {
    node_id: String,
    backend: Arc<MemoryClusterBackend>,
    leadership: Arc<dyn LeaderElection>,
}

impl MemoryClusterStore {
    /// A private single-node cluster (standalone deployments)
    pub async fn standalone(
        node_id: impl Into<String>,
        leadership: Arc<dyn LeaderElection>,
    ) -> Self {
        MemoryClusterBackend::new().attach(node_id, leadership).await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn ensure_leader(&self) -> Result<()> {
        if self.leadership.is_leader().await {
            return Ok(());
        }
        error!(node_id = %self.node_id, "Publish attempted by a node that is not the leader");
        Err(SyncError::NotLeader {
            node_id: self.node_id.clone(),
        })
    }

    async fn assert_single_writer(&self) -> Result<()> {
        let others: Vec<(String, Arc<dyn LeaderElection>)> = self
            .backend
            .nodes
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != self.node_id)
            .map(|(id, leadership)| (id.clone(), Arc::clone(leadership)))
            .collect();

        for (other, leadership) in others {
            if leadership.is_leader().await {
                error!(
                    node_id = %self.node_id,
                    other = %other,
                    "Two nodes claim leadership of the peer store"
                );
                return Err(SyncError::ConcurrentWriter(format!(
                    "{} and {} both claim leadership",
                    self.node_id, other
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterKeyStore for MemoryClusterStore {
    async fn publish(&self, snapshot: &ClusterSnapshot) -> Result<PublishOutcome> {
        self.ensure_leader().await?;
        self.assert_single_writer().await?;

        let mut state = self.backend.state.write().await;
        if state.snapshot == *snapshot {
            debug!(node_id = %self.node_id, "Snapshot unchanged, nothing to publish");
            return Ok(PublishOutcome::Unchanged);
        }

        // Leadership may have moved while waiting for the write lock
        self.ensure_leader().await?;

        state.snapshot = snapshot.clone();
        state.revision += 1;
        state.writer = Some(self.node_id.clone());
        let revision = state.revision;
        drop(state);

        // No receivers is fine: nobody is watching yet
        let _ = self.backend.changes.send(snapshot.clone());

        info!(
            node_id = %self.node_id,
            revision = revision,
            keys = snapshot.key_count(),
            "Key snapshot published"
        );

        Ok(PublishOutcome::Published { revision })
    }

    async fn read(&self) -> Result<ClusterSnapshot> {
        Ok(self.backend.state.read().await.snapshot.clone())
    }

    fn watch(&self) -> SnapshotStream<'_> {
        let receiver = self.backend.changes.subscribe();
        Box::pin(
            BroadcastStream::new(receiver)
                .map(|change| change.map_err(|e| SyncError::Watch(e.to_string()))),
        )
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}
