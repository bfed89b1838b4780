//! Key lifecycle management for keysync
//!
//! Keeps the token-signing and credential-encryption key repositories of a
//! replicated identity service consistent across the cluster: the leader
//! rotates and publishes, every other node reconciles its local copy.
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


pub mod bootstrap;
pub mod error;
pub mod policy;
pub mod process;
pub mod rotation;
pub mod storage;
pub mod sync;

pub use bootstrap::KeyBootstrapper;
pub use error::{KeyError, KeyResult, RotationPrimitiveError, StorageError};
pub use policy::{RotationDecision, RotationPolicy};
pub use process::{KeystoneManage, ProcessExecutor, ProcessOutput, TokioProcessExecutor};
pub use rotation::{KeyRotator, KeystoneManageRotator, RotationEngine, RotationReport, RotationState};
pub use storage::{fingerprint, KeyStorage, LocalKeyStorage};
pub use sync::{SyncAgent, SyncOutcome, SyncReport};
