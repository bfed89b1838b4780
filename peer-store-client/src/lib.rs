//! Peer Store Client Library
//!
//! Shared, leader-written storage for the cluster key snapshot, plus the
//! leadership queries that guard every write. Backed by NATS JetStream
//! key-value in production and by an in-process map in tests and
//! standalone deployments.

pub mod error;
pub mod leadership;
pub mod memory;
pub mod nats;
pub mod traits;

pub use error::*;
pub use leadership::*;
pub use memory::*;
pub use nats::*;
pub use traits::*;
