//! Follower-side reconciliation against the published snapshot
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


use keysync_types::{KeyPurpose, KeyRepository};
use peer_store_client::ClusterKeyStore;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{KeyResult, StorageError};
use crate::storage::{fingerprint, KeyStorage};

/// What a follower reconciliation changed locally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub removed: usize,
    /// Purposes that could not be reconciled, with the reason
    pub failed: Vec<(KeyPurpose, String)>,
    /// Whether this run wrote the key-setup sentinel
    pub initialized: bool,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.written > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The leader's local storage is the source of truth
    SkippedLeader,
    /// Nothing has been published yet
    NotReady,
    Reconciled(SyncReport),
}

/// Makes local storage match the leader's published snapshot
pub struct SyncAgent {
    storage: Arc<dyn KeyStorage>,
    store: Arc<dyn ClusterKeyStore>,
}

impl SyncAgent {
    pub fn new(storage: Arc<dyn KeyStorage>, store: Arc<dyn ClusterKeyStore>) -> Self {
        Self { storage, store }
    }

    pub async fn reconcile(&self, is_leader: bool) -> KeyResult<SyncOutcome> {
        if is_leader {
            debug!("Leader node, skipping key reconciliation");
            return Ok(SyncOutcome::SkippedLeader);
        }

        let snapshot = self.store.read().await?;
        if snapshot.is_empty() {
            info!("No keys published by the leader yet, node not ready");
            return Ok(SyncOutcome::NotReady);
        }

        let mut report = SyncReport::default();
        for repository in snapshot.repositories() {
            match self.reconcile_repository(repository).await {
                Ok((written, removed)) => {
                    report.written += written;
                    report.removed += removed;
                }
                Err(e) => {
                    error!(repository = %repository.purpose, error = %e, "Failed to reconcile key repository");
                    report.failed.push((repository.purpose, e.to_string()));
                }
            }
        }

        if report.failed.is_empty() && (report.changed() || !self.storage.is_initialized().await?) {
            self.storage.mark_initialized().await?;
            report.initialized = true;
        }

        if report.changed() {
            info!(
                written = report.written,
                removed = report.removed,
                "Local key repositories reconciled"
            );
        }

        Ok(SyncOutcome::Reconciled(report))
    }

    async fn reconcile_repository(
        &self,
        published: &KeyRepository,
    ) -> Result<(usize, usize), StorageError> {
        let purpose = published.purpose;
        if published.is_empty() {
            debug!(repository = %purpose, "Published repository is empty, leaving local copy");
            return Ok((0, 0));
        }

        self.storage.ensure_location(purpose).await?;

        let mut written = 0;
        for entry in published.entries() {
            if self
                .storage
                .write_if_changed(purpose, entry.index, &entry.content)
                .await?
            {
                written += 1;
                if entry.is_staging() {
                    debug!(repository = %purpose, staging = %fingerprint(&entry.content), "Staging key updated");
                }
            }
        }

        let mut removed = 0;
        let local = self.storage.read_all(purpose).await?;
        for index in local.indices().filter(|index| !published.contains(*index)) {
            if self.storage.remove(purpose, index).await? {
                removed += 1;
            }
        }

        Ok((written, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalKeyStorage;
    use keysync_types::{ClusterSnapshot, KeyEntry};
    use peer_store_client::{MemoryClusterBackend, MemoryClusterStore, StaticLeadership};
    use tempfile::tempdir;

    fn snapshot(tokens: &[(u32, &str)], credentials: &[(u32, &str)]) -> ClusterSnapshot {
        let mut token_repo = KeyRepository::new(KeyPurpose::TokenSigning);
        for (index, content) in tokens {
            token_repo.insert(KeyEntry::new(*index, *content));
        }
        let mut credential_repo = KeyRepository::new(KeyPurpose::CredentialEncryption);
        for (index, content) in credentials {
            credential_repo.insert(KeyEntry::new(*index, *content));
        }
        ClusterSnapshot::from_repositories([token_repo, credential_repo])
    }

    async fn cluster() -> (MemoryClusterStore, Arc<MemoryClusterStore>) {
        let backend = MemoryClusterBackend::new();
        let leader = backend.attach("leader", Arc::new(StaticLeadership(true))).await;
        let follower = backend.attach("follower", Arc::new(StaticLeadership(false))).await;
        (leader, Arc::new(follower))
    }

    fn report(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Reconciled(report) => report,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leader_is_skipped() {
        let dir = tempdir().unwrap();
        let (_leader, follower) = cluster().await;
        let agent = SyncAgent::new(Arc::new(LocalKeyStorage::new(dir.path())), follower);

        assert_eq!(agent.reconcile(true).await.unwrap(), SyncOutcome::SkippedLeader);
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_not_ready() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalKeyStorage::new(dir.path()));
        let (_leader, follower) = cluster().await;
        let agent = SyncAgent::new(storage.clone(), follower);

        assert_eq!(agent.reconcile(false).await.unwrap(), SyncOutcome::NotReady);
        assert_eq!(storage.physical_writes(), 0);
        assert!(!storage.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_materializes_published_keys() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalKeyStorage::new(dir.path()));
        let (leader, follower) = cluster().await;
        leader
            .publish(&snapshot(&[(0, "staging"), (1, "primary")], &[(0, "cred")]))
            .await
            .unwrap();
        let agent = SyncAgent::new(storage.clone(), follower);

        let first = report(agent.reconcile(false).await.unwrap());
        assert_eq!(first.written, 3);
        assert!(first.initialized);
        assert!(storage.is_initialized().await.unwrap());

        let tokens = storage.read_all(KeyPurpose::TokenSigning).await.unwrap();
        assert_eq!(tokens.get(1).unwrap().content, b"primary".to_vec());

        let second = report(agent.reconcile(false).await.unwrap());
        assert_eq!(second, SyncReport::default());
        assert_eq!(storage.physical_writes(), 3);
    }

    #[tokio::test]
    async fn test_removes_keys_dropped_by_leader() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalKeyStorage::new(dir.path()));
        let (leader, follower) = cluster().await;
        let agent = SyncAgent::new(storage.clone(), follower);

        leader
            .publish(&snapshot(&[(0, "s1"), (1, "p1"), (2, "p2")], &[(0, "cred")]))
            .await
            .unwrap();
        agent.reconcile(false).await.unwrap();

        leader
            .publish(&snapshot(&[(0, "s2"), (2, "p2"), (3, "s1")], &[(0, "cred")]))
            .await
            .unwrap();
        let report = report(agent.reconcile(false).await.unwrap());

        assert_eq!(report.written, 2);
        assert_eq!(report.removed, 1);
        let tokens = storage.read_all(KeyPurpose::TokenSigning).await.unwrap();
        assert_eq!(tokens.indices().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_purpose_does_not_block_others() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalKeyStorage::new(dir.path()));
        std::fs::write(storage.repository_path(KeyPurpose::CredentialEncryption), b"").unwrap();
        let (leader, follower) = cluster().await;
        leader
            .publish(&snapshot(&[(0, "staging")], &[(0, "cred")]))
            .await
            .unwrap();
        let agent = SyncAgent::new(storage.clone(), follower);

        let report = report(agent.reconcile(false).await.unwrap());

        assert_eq!(report.written, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, KeyPurpose::CredentialEncryption);
        assert!(!report.initialized);
        assert!(!storage.is_initialized().await.unwrap());
    }
}
