//! Keysync Types
//!
//! Shared data model for key repositories and the cluster-wide key snapshot
//! used by every keysync crate.

pub mod error;
pub mod keys;
pub mod snapshot;

pub use error::*;
pub use keys::*;
pub use snapshot::*;
