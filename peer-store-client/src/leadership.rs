//! Leader election queries

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answers "is this node the leader right now?"; asked again on every tick
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Leadership fixed at startup from configuration
#[derive(Debug, Clone, Copy)]
pub struct StaticLeadership(pub bool);

#[async_trait]
impl LeaderElection for StaticLeadership {
    async fn is_leader(&self) -> bool {
        self.0
    }
}

/// Leadership that can be granted or revoked at runtime.
///
/// Clones share the same flag, so the holder of one clone can hand the
/// leader role over while the other observes it.
#[derive(Debug, Clone, Default)]
pub struct LeadershipFlag {
    leader: Arc<AtomicBool>,
}

impl LeadershipFlag {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(leader)),
        }
    }

    pub fn grant(&self) {
        self.leader.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.leader.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaderElection for LeadershipFlag {
    async fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
