//! First-run key setup on the leader
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


use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::KeyResult;
use crate::process::{log_primitive_failure, KeystoneManage, ProcessExecutor};
use crate::storage::KeyStorage;

const SETUP_STEPS: [&str; 3] = ["fernet_setup", "credential_setup", "credential_migrate"];

/// Creates the initial key repositories when the node has never been set up
pub struct KeyBootstrapper {
    executor: Arc<dyn ProcessExecutor>,
    manage: KeystoneManage,
    timeout: Duration,
    storage: Arc<dyn KeyStorage>,
}

impl KeyBootstrapper {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        manage: KeystoneManage,
        timeout: Duration,
        storage: Arc<dyn KeyStorage>,
    ) -> Self {
        Self {
            executor,
            manage,
            timeout,
            storage,
        }
    }

    /// Run the setup commands unless the key-setup sentinel exists.
    ///
    /// Returns whether setup ran. The sentinel is only written after every
    /// step succeeded, so a failed setup is attempted again next time.
    pub async fn ensure_bootstrapped(&self) -> KeyResult<bool> {
        if self.storage.is_initialized().await? {
            return Ok(false);
        }

        info!("Key material not initialized, running initial key setup");

        for step in SETUP_STEPS {
            let command = self.manage.command(step);
            if let Err(e) = self.executor.execute(&command, self.timeout).await {
                log_primitive_failure(step, &e);
                warn!(step = step, "Initial key setup failed, will retry on next configuration change");
                return Err(e.into());
            }
            info!(step = step, "Key setup step completed");
        }

        self.storage.mark_initialized().await?;
        Ok(true)
    }
}
