//! NATS JetStream key-value implementation of the peer store
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


use async_nats::jetstream::{self, kv, Context};
use async_trait::async_trait;
use futures::StreamExt;
use keysync_types::ClusterSnapshot;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::leadership::LeaderElection;
use crate::traits::{ClusterKeyStore, PublishOutcome, SnapshotStream};

/// Key under which the snapshot lives inside the bucket
pub const SNAPSHOT_KEY: &str = "key_repository";

/// Peer store backed by a JetStream key-value bucket.
///
/// Writes use compare-and-swap on the entry revision, so a publish racing a
/// newer leader is rejected instead of overwriting its snapshot.
pub struct NatsClusterStore {
    store: kv::Store,
    bucket: String,
    node_id: String,
    leadership: Arc<dyn LeaderElection>,
}

impl NatsClusterStore {
    /// Connect to NATS and open (or create) the snapshot bucket
    pub async fn connect(
        url: &str,
        bucket: &str,
        node_id: impl Into<String>,
        leadership: Arc<dyn LeaderElection>,
    ) -> Result<Self> {
        info!(url = url, bucket = bucket, "Connecting to NATS server");

        let client = async_nats::connect(url)
            .await
            .map_err(|e| SyncError::Unavailable(e.to_string()))?;
        let jetstream = jetstream::new(client);
        let store = Self::ensure_bucket(&jetstream, bucket).await?;

        info!(bucket = bucket, "NATS peer store initialized");

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            node_id: node_id.into(),
            leadership,
        })
    }

    /// Ensure the key-value bucket exists
    async fn ensure_bucket(jetstream: &Context, bucket: &str) -> Result<kv::Store> {
        if let Ok(store) = jetstream.get_key_value(bucket).await {
            return Ok(store);
        }

        debug!(bucket = bucket, "Creating key-value bucket");
        jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                description: "keysync cluster key snapshot".to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| SyncError::Unavailable(format!("Failed to create bucket: {}", e)))
    }

    async fn current_entry(&self) -> Result<Option<kv::Entry>> {
        self.store
            .entry(SNAPSHOT_KEY)
            .await
            .map_err(|e| SyncError::Unavailable(e.to_string()))
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
}

/// Decode a bucket entry; deleted or missing entries are an empty snapshot
fn decode(entry: Option<&kv::Entry>) -> Result<ClusterSnapshot> {
    match entry {
        Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
            Ok(ClusterSnapshot::from_json(&entry.value)?)
        }
        _ => Ok(ClusterSnapshot::empty()),
    }
}

#[async_trait]
impl ClusterKeyStore for NatsClusterStore {
    async fn publish(&self, snapshot: &ClusterSnapshot) -> Result<PublishOutcome> {
        self.ensure_leader().await?;

        let entry = self.current_entry().await?;
        match decode(entry.as_ref()) {
            Ok(current) if current == *snapshot => {
                debug!(node_id = %self.node_id, "Snapshot unchanged, nothing to publish");
                return Ok(PublishOutcome::Unchanged);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Published snapshot is unreadable, replacing it"),
        }

        let payload = snapshot.to_json()?;

        // Last check before commit; the revision guard covers the rest
        self.ensure_leader().await?;

        // Revision 0 only succeeds while the key does not exist yet
        let expected = entry.as_ref().map_or(0, |entry| entry.revision);
        let revision = self
            .store
            .update(SNAPSHOT_KEY, payload.into(), expected)
            .await
            .map_err(|e| SyncError::Superseded(e.to_string()))?;

        info!(
            node_id = %self.node_id,
            bucket = %self.bucket,
            revision = revision,
            keys = snapshot.key_count(),
            "Key snapshot published"
        );

        Ok(PublishOutcome::Published { revision })
    }

    async fn read(&self) -> Result<ClusterSnapshot> {
        let entry = self.current_entry().await?;
        decode(entry.as_ref())
    }

    fn watch(&self) -> SnapshotStream<'_> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ClusterSnapshot>>(16);
        let store = self.store.clone();
        let bucket = self.bucket.clone();

        // Spawn a task to forward bucket updates
        tokio::spawn(async move {
            match store.watch(SNAPSHOT_KEY).await {
                Ok(mut watcher) => {
                    info!(bucket = %bucket, "Watching key snapshot");

                    while let Some(change) = watcher.next().await {
                        let item = match change {
                            Ok(entry) => decode(Some(&entry)),
                            Err(e) => Err(SyncError::Watch(e.to_string())),
                        };
                        if tx.send(item).await.is_err() {
                            debug!("Receiver dropped, stopping snapshot watch");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to watch key snapshot");
                    let _ = tx.send(Err(SyncError::Watch(e.to_string()))).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn store_type(&self) -> &str {
        "nats"
    }
}
