//! Per-node tick dispatch
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


use chrono::{DateTime, Utc};
use keysync_keys::{
    KeyBootstrapper, KeyError, RotationEngine, RotationPolicy, RotationReport, SyncAgent,
    SyncOutcome,
};
use peer_store_client::{LeaderElection, PublishOutcome};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Why a tick runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickReason {
    /// Startup or configuration reload
    ConfigChanged,
    /// The published snapshot changed
    PeerKeysChanged,
    /// Periodic timer
    Scheduled,
}

impl fmt::Display for TickReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickReason::ConfigChanged => write!(f, "config_changed"),
            TickReason::PeerKeysChanged => write!(f, "peer_keys_changed"),
            TickReason::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// What this node knows about itself between ticks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeState {
    pub node_id: String,
    pub ticks: u64,
    pub last_reason: Option<TickReason>,
    pub last_tick: Option<DateTime<Utc>>,
    pub is_leader: Option<bool>,
    /// Follower: local keys match a published snapshot
    pub ready: bool,
    pub last_rotation: Option<DateTime<Utc>>,
    pub published_revision: Option<u64>,
    pub last_error: Option<String>,
}

impl NodeState {
    fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }
}

struct Inner {
    engine: RotationEngine,
    state: NodeState,
}

/// Drives one node: the leader rotates and publishes, followers reconcile.
///
/// Ticks never overlap. A scheduled or config tick requested while another is
/// running is skipped; the next timer tick picks up the work. A peer key
/// change is never dropped: it is deferred and run by whichever tick holds
/// the run lock when it finishes.
pub struct KeyCoordinator {
    leadership: Arc<dyn LeaderElection>,
    bootstrapper: Option<KeyBootstrapper>,
    sync: SyncAgent,
    /// Latest policy, applied to the engine at the start of each tick
    policy: watch::Sender<RotationPolicy>,
    peer_change_pending: AtomicBool,
    inner: Mutex<Inner>,
}

impl KeyCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        leadership: Arc<dyn LeaderElection>,
        engine: RotationEngine,
        sync: SyncAgent,
    ) -> Self {
        let (policy, _) = watch::channel(engine.policy());
        Self {
            leadership,
            bootstrapper: None,
            sync,
            policy,
            peer_change_pending: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                engine,
                state: NodeState::new(node_id),
            }),
        }
    }

    /// Run initial key setup on the leader when the configuration changes
    pub fn with_bootstrapper(mut self, bootstrapper: KeyBootstrapper) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
    }

    /// Run one tick. Returns the resulting state, or `None` if a tick was
    /// already in progress.
    pub async fn tick(&self, reason: TickReason) -> Option<NodeState> {
        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(_) if reason == TickReason::PeerKeysChanged => {
                self.peer_change_pending.store(true, Ordering::SeqCst);
                // The holder may have released the lock before seeing the flag
                let inner = self.inner.try_lock().ok()?;
                self.peer_change_pending.store(false, Ordering::SeqCst);
                inner
            }
            Err(_) => {
                debug!(reason = %reason, "Tick already in progress, skipping");
                return None;
            }
        };

        let mut state = self.run(&mut inner, reason).await;
        drop(inner);

        while self.peer_change_pending.swap(false, Ordering::SeqCst) {
            debug!("Running deferred peer key change");
            let mut inner = self.inner.lock().await;
            state = self.run(&mut inner, TickReason::PeerKeysChanged).await;
        }

        Some(state)
    }

    /// Hand over a reloaded rotation policy. Never waits for a running tick;
    /// the next tick applies it.
    pub fn update_policy(&self, policy: RotationPolicy) {
        self.policy.send_replace(policy);
    }

    /// Current node state; waits for a running tick to finish
    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state.clone()
    }

    async fn run(&self, inner: &mut Inner, reason: TickReason) -> NodeState {
        let is_leader = self.leadership.is_leader().await;
        let Inner { engine, state } = inner;
        engine.set_policy(*self.policy.borrow());
        note_leadership(state, is_leader);

        let mut errors = Vec::new();
        match reason {
            TickReason::ConfigChanged => {
                self.on_config_changed(engine, state, is_leader, &mut errors).await
            }
            TickReason::PeerKeysChanged => {
                self.on_peer_keys_changed(state, is_leader, &mut errors).await
            }
            TickReason::Scheduled => self.on_scheduled(engine, state, is_leader, &mut errors).await,
        }

        state.ticks += 1;
        state.last_reason = Some(reason);
        state.last_tick = Some(Utc::now());
        state.last_error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };

        state.clone()
    }

    async fn on_config_changed(
        &self,
        engine: &mut RotationEngine,
        state: &mut NodeState,
        is_leader: bool,
        errors: &mut Vec<String>,
    ) {
        if !is_leader {
            self.reconcile(state, errors).await;
            return;
        }

        if let Some(bootstrapper) = &self.bootstrapper {
            match bootstrapper.ensure_bootstrapped().await {
                Ok(true) => info!("Initial key setup completed"),
                Ok(false) => debug!("Key material already initialized"),
                Err(e) => errors.push(format!("bootstrap: {}", e)),
            }
        }
        rotate(engine, state, errors).await;
    }

    async fn on_peer_keys_changed(
        &self,
        state: &mut NodeState,
        is_leader: bool,
        errors: &mut Vec<String>,
    ) {
        if is_leader {
            // Our own publish coming back
            debug!("Ignoring peer key change on the leader");
            return;
        }
        self.reconcile(state, errors).await;
    }

    async fn on_scheduled(
        &self,
        engine: &mut RotationEngine,
        state: &mut NodeState,
        is_leader: bool,
        errors: &mut Vec<String>,
    ) {
        if is_leader {
            rotate(engine, state, errors).await;
        } else {
            self.reconcile(state, errors).await;
        }
    }

    async fn reconcile(&self, state: &mut NodeState, errors: &mut Vec<String>) {
        match self.sync.reconcile(false).await {
            Ok(SyncOutcome::Reconciled(report)) => {
                for (purpose, reason) in &report.failed {
                    errors.push(format!("reconcile {}: {}", purpose, reason));
                }
                state.ready = report.failed.is_empty();
            }
            Ok(SyncOutcome::NotReady) => state.ready = false,
            Ok(SyncOutcome::SkippedLeader) => {}
            Err(e) => {
                warn!(error = %e, "Key reconciliation failed, retrying next tick");
                errors.push(format!("reconcile: {}", e));
            }
        }
    }
}

async fn rotate(engine: &mut RotationEngine, state: &mut NodeState, errors: &mut Vec<String>) {
    let now = Utc::now();
    match engine.run_tick(now).await {
        Ok(RotationReport {
            rotated, publish, ..
        }) => {
            if rotated {
                state.last_rotation = Some(now);
            }
            if let PublishOutcome::Published { revision } = publish {
                state.published_revision = Some(revision);
            }
            state.ready = true;
        }
        Err(KeyError::Rotation(e)) => errors.push(format!("rotation: {}", e)),
        Err(e) => {
            error!(error = %e, "Leader tick failed");
            errors.push(format!("leader tick: {}", e));
        }
    }
}

fn note_leadership(state: &mut NodeState, is_leader: bool) {
    match state.is_leader {
        Some(previous) if previous == is_leader => {}
        Some(_) if is_leader => info!(node_id = %state.node_id, "Node acquired leadership"),
        Some(_) => warn!(node_id = %state.node_id, "Node lost leadership"),
        None => info!(node_id = %state.node_id, leader = is_leader, "Initial leadership state"),
    }
    state.is_leader = Some(is_leader);
}
