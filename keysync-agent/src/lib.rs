//! keysync agent
//!
//! Runs on every node of the identity service cluster:
//! - Leader: initial key setup, periodic Fernet key rotation, snapshot publishing
//! - Followers: reconciling local key repositories with the published snapshot
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


pub mod coordinator;
pub mod node;
pub mod retry;

pub use coordinator::{KeyCoordinator, NodeState, TickReason};
pub use node::Node;
