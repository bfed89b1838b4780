//! Error types for peer store operations

use keysync_types::TypesError;
use thiserror::Error;

/// Errors that can occur while reading or publishing the cluster snapshot
#[derive(Error, Debug)]
pub enum SyncError {
    /// A non-leader tried to publish; the leadership contract was bypassed
    #[error("Node {node_id} attempted to publish without holding leadership")]
    NotLeader { node_id: String },

    /// Another node published while this node still believed it was leader
    #[error("Concurrent writer detected: {0}")]
    ConcurrentWriter(String),

    /// The write lost a compare-and-swap race and was rejected
    #[error("Publish superseded: {0}")]
    Superseded(String),

    #[error("Peer store unavailable: {0}")]
    Unavailable(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Invalid snapshot: {0}")]
    Snapshot(#[from] TypesError),
}

impl SyncError {
    /// Whether this error means the leadership contract was violated
    pub fn is_leadership_violation(&self) -> bool {
        matches!(self, SyncError::NotLeader { .. } | SyncError::ConcurrentWriter(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
