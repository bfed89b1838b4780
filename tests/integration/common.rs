//! Shared fixtures: in-memory cluster nodes with a fake `fernet_rotate`

#![allow(dead_code)]

use async_trait::async_trait;
use keysync_agent::{KeyCoordinator, NodeState, TickReason};
use keysync_keys::{
    KeyRotator, KeyStorage, LocalKeyStorage, RotationEngine, RotationPolicy,
    RotationPrimitiveError, SyncAgent,
};
use keysync_types::{KeyPurpose, KeyRepository};
use peer_store_client::{LeaderElection, LeadershipFlag, MemoryClusterBackend, MemoryClusterStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Behaves like `keystone-manage fernet_rotate` on a local repository:
/// staging becomes the new primary and a fresh staging key is written.
pub struct FakeRotator {
    name: String,
    storage: Arc<LocalKeyStorage>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeRotator {
    pub fn new(name: &str, storage: Arc<LocalKeyStorage>) -> Self {
        Self {
            name: name.to_string(),
            storage,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyRotator for FakeRotator {
    async fn rotate(&self) -> Result<(), RotationPrimitiveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(RotationPrimitiveError::Failed {
                exit_code: Some(1),
                stderr: "CRITICAL keystone [-] Unable to rotate keys\nPermission denied".to_string(),
            });
        }

        let failed = |e: keysync_keys::StorageError| RotationPrimitiveError::Failed {
            exit_code: Some(1),
            stderr: e.to_string(),
        };
        let repository = self.storage.read_all(KeyPurpose::TokenSigning).await.map_err(failed)?;
        let staging = repository.staging().ok_or_else(|| RotationPrimitiveError::Failed {
            exit_code: Some(1),
            stderr: "key repository is empty".to_string(),
        })?;
        let next = repository.indices().max().unwrap_or(0) + 1;

        self.storage
            .write_if_changed(KeyPurpose::TokenSigning, next, &staging.content)
            .await
            .map_err(failed)?;
        self.storage
            .write_if_changed(
                KeyPurpose::TokenSigning,
                0,
                format!("{}-staging-{}", self.name, call).as_bytes(),
            )
            .await
            .map_err(failed)?;
        Ok(())
    }
}

/// One cluster member with its own key directory
pub struct TestNode {
    pub name: String,
    pub storage: Arc<LocalKeyStorage>,
    pub store: Arc<MemoryClusterStore>,
    pub leadership: LeadershipFlag,
    pub rotator: Arc<FakeRotator>,
    pub coordinator: KeyCoordinator,
    _dir: TempDir,
}

impl TestNode {
    pub async fn tick(&self, reason: TickReason) -> NodeState {
        self.coordinator
            .tick(reason)
            .await
            .expect("no other tick should be running")
    }

    pub async fn tokens(&self) -> KeyRepository {
        self.storage
            .read_all(KeyPurpose::TokenSigning)
            .await
            .unwrap()
            .without_timestamps()
    }

    pub async fn credentials(&self) -> KeyRepository {
        self.storage
            .read_all(KeyPurpose::CredentialEncryption)
            .await
            .unwrap()
            .without_timestamps()
    }
}

pub struct NodeBuilder {
    name: String,
    leader: bool,
    token_expiration: i64,
    max_active_keys: u32,
    seeded: bool,
    election: Option<Arc<dyn LeaderElection>>,
}

impl NodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            leader: false,
            token_expiration: 3600,
            max_active_keys: 3,
            seeded: false,
            election: None,
        }
    }

    pub fn leader(mut self) -> Self {
        self.leader = true;
        self
    }

    /// Start from an initialized repository: staging, one primary, one credential key
    pub fn seeded(mut self) -> Self {
        self.seeded = true;
        self
    }

    pub fn token_expiration(mut self, seconds: i64) -> Self {
        self.token_expiration = seconds;
        self
    }

    /// Use a custom election instead of the node's flag
    pub fn election(mut self, election: Arc<dyn LeaderElection>) -> Self {
        self.election = Some(election);
        self
    }

    pub async fn attach(self, backend: &Arc<MemoryClusterBackend>) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalKeyStorage::new(dir.path()));

        if self.seeded {
            for purpose in KeyPurpose::ALL {
                storage.ensure_location(purpose).await.unwrap();
            }
            let seed = [
                (KeyPurpose::TokenSigning, 0, "staging-0"),
                (KeyPurpose::TokenSigning, 1, "primary-0"),
                (KeyPurpose::CredentialEncryption, 0, "credential-0"),
            ];
            for (purpose, index, content) in seed {
                let content = format!("{}-{}", self.name, content);
                storage.write_if_changed(purpose, index, content.as_bytes()).await.unwrap();
            }
            storage.mark_initialized().await.unwrap();
        }

        let leadership = LeadershipFlag::new(self.leader);
        let election = self
            .election
            .unwrap_or_else(|| Arc::new(leadership.clone()) as Arc<dyn LeaderElection>);
        let store = Arc::new(backend.attach(self.name.clone(), Arc::clone(&election)).await);
        let rotator = Arc::new(FakeRotator::new(&self.name, storage.clone()));

        let policy = RotationPolicy::new(self.token_expiration, self.max_active_keys).unwrap();
        let engine = RotationEngine::new(storage.clone(), store.clone(), rotator.clone(), policy);
        let sync = SyncAgent::new(storage.clone(), store.clone());
        let coordinator = KeyCoordinator::new(self.name.clone(), election, engine, sync);

        TestNode {
            name: self.name,
            storage,
            store,
            leadership,
            rotator,
            coordinator,
            _dir: dir,
        }
    }
}
