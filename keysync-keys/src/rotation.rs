//! Leader-side key rotation and publishing
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
use chrono::{DateTime, Utc};
use keysync_types::{ClusterSnapshot, KeyIndex, KeyPurpose};
use peer_store_client::{ClusterKeyStore, PublishOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{KeyError, KeyResult, RotationPrimitiveError};
use crate::policy::{RotationDecision, RotationPolicy};
use crate::process::{log_primitive_failure, KeystoneManage, ProcessExecutor};
use crate::storage::{fingerprint, KeyStorage};

/// The external primitive that rotates token-signing keys on local storage
#[async_trait]
pub trait KeyRotator: Send + Sync {
    async fn rotate(&self) -> Result<(), RotationPrimitiveError>;
}

/// Rotates with `keystone-manage fernet_rotate`
pub struct KeystoneManageRotator {
    executor: Arc<dyn ProcessExecutor>,
    manage: KeystoneManage,
    timeout: Duration,
}

impl KeystoneManageRotator {
    pub fn new(executor: Arc<dyn ProcessExecutor>, manage: KeystoneManage, timeout: Duration) -> Self {
        Self {
            executor,
            manage,
            timeout,
        }
    }
}

#[async_trait]
impl KeyRotator for KeystoneManageRotator {
    async fn rotate(&self) -> Result<(), RotationPrimitiveError> {
        let command = self.manage.command("fernet_rotate");
        debug!(command = %command.join(" "), "Rotating Fernet keys");
        self.executor.execute(&command, self.timeout).await?;
        Ok(())
    }
}

/// Where the engine is within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    AwaitInit,
    Evaluate,
    Rotating,
    Publishing,
}

/// What one leader tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub decision: RotationDecision,
    pub rotated: bool,
    /// Token-signing indices removed to respect `max_active_keys`
    pub pruned: Vec<KeyIndex>,
    pub publish: PublishOutcome,
}

/// Decides, rotates and publishes on the leader.
///
/// Every tick walks `AwaitInit → Evaluate → [Rotating] → Publishing` and
/// ends back in `AwaitInit`. A failed rotation ends the tick before
/// `Publishing`, so the previously published snapshot stays authoritative.
pub struct RotationEngine {
    storage: Arc<dyn KeyStorage>,
    store: Arc<dyn ClusterKeyStore>,
    rotator: Arc<dyn KeyRotator>,
    policy: RotationPolicy,
    state: RotationState,
}

impl RotationEngine {
    pub fn new(
        storage: Arc<dyn KeyStorage>,
        store: Arc<dyn ClusterKeyStore>,
        rotator: Arc<dyn KeyRotator>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            storage,
            store,
            rotator,
            policy,
            state: RotationState::AwaitInit,
        }
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Swap the policy after a configuration change
    pub fn set_policy(&mut self, policy: RotationPolicy) {
        if policy != self.policy {
            info!(
                token_expiration = policy.token_expiration_secs(),
                max_active_keys = policy.max_active_keys(),
                rotation_interval = policy.rotation_interval_secs(),
                "Rotation policy updated"
            );
        }
        self.policy = policy;
    }

    fn transition(&mut self, next: RotationState) {
        debug!(from = ?self.state, to = ?next, "Rotation state transition");
        self.state = next;
    }

    /// Run one leader tick at time `now`
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> KeyResult<RotationReport> {
        let result = self.step(now).await;
        self.transition(RotationState::AwaitInit);
        result
    }

    async fn step(&mut self, now: DateTime<Utc>) -> KeyResult<RotationReport> {
        self.transition(RotationState::AwaitInit);
        let tokens = self.storage.read_all(KeyPurpose::TokenSigning).await?;

        let decision = if tokens.staging().is_none() {
            warn!("Fernet key rotation requested but key repository not initialized yet");
            RotationDecision::Unevaluable
        } else {
            self.transition(RotationState::Evaluate);
            self.policy.evaluate(tokens.staging(), now)
        };

        let rotated = match decision {
            RotationDecision::Due => {
                self.transition(RotationState::Rotating);
                if let Err(e) = self.rotator.rotate().await {
                    log_primitive_failure("fernet_rotate", &e);
                    error!("Fernet key rotation failed, keeping the published snapshot");
                    return Err(KeyError::Rotation(e));
                }
                info!("Fernet keys successfully rotated");
                true
            }
            RotationDecision::NotDue { remaining } => {
                debug!(remaining_secs = remaining.num_seconds(), "No rotation needed");
                false
            }
            RotationDecision::Unevaluable => false,
        };

        self.transition(RotationState::Publishing);
        let (snapshot, pruned) = self.collect_snapshot().await?;

        let publish = match self.store.publish(&snapshot).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_leadership_violation() => {
                error!(error = %e, "Key snapshot publish refused: leadership contract violated");
                return Err(KeyError::Sync(e));
            }
            Err(e) => {
                warn!(error = %e, "Key snapshot publish failed, retrying next tick");
                return Err(KeyError::Sync(e));
            }
        };

        if rotated {
            info!(published = publish.is_published(), "Rotated and started sync of fernet keys");
        }

        Ok(RotationReport {
            decision,
            rotated,
            pruned,
            publish,
        })
    }

    /// Re-read local storage for every purpose, bounding the token keys
    async fn collect_snapshot(&self) -> KeyResult<(ClusterSnapshot, Vec<KeyIndex>)> {
        let mut snapshot = ClusterSnapshot::empty();
        let mut pruned = Vec::new();

        for purpose in KeyPurpose::ALL {
            let mut repository = self.storage.read_all(purpose).await?;

            let excess = repository.excess_keys(self.policy.max_active_keys() as usize);
            if !excess.is_empty() {
                warn!(
                    repository = %purpose,
                    keys = repository.len(),
                    max_active_keys = self.policy.max_active_keys(),
                    excess = ?excess,
                    "Pruning keys beyond max_active_keys"
                );
                for index in &excess {
                    self.storage.remove(purpose, *index).await?;
                }
                repository = self.storage.read_all(purpose).await?;
                pruned.extend(excess);
            }

            if let Some(staging) = repository.staging() {
                debug!(
                    repository = %purpose,
                    keys = repository.len(),
                    staging = %fingerprint(&staging.content),
                    "Collected key repository"
                );
            }
            snapshot.insert(repository);
        }

        Ok((snapshot, pruned))
    }
}
