//! External command execution for key primitives
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
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::error::RotationPrimitiveError;

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion, bounded by `timeout`
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RotationPrimitiveError>;
}

/// Executes commands as local child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessExecutor;

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn execute(
        &self,
        command: &[String],
        limit: Duration,
    ) -> Result<ProcessOutput, RotationPrimitiveError> {
        let Some((program, args)) = command.split_first() else {
            return Err(RotationPrimitiveError::Spawn("empty command".to_string()));
        };

        debug!(command = %command.join(" "), "Executing command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RotationPrimitiveError::Spawn(format!("{}: {}", program, e)))?;

        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if output.status.success() {
                    Ok(ProcessOutput { stdout, stderr })
                } else {
                    Err(RotationPrimitiveError::Failed {
                        exit_code: output.status.code(),
                        stderr,
                    })
                }
            }
            Ok(Err(e)) => Err(RotationPrimitiveError::Spawn(e.to_string())),
            Err(_) => {
                // Dropping the wait future kills the child
                error!(command = %command.join(" "), timeout = ?limit, "Command timed out");
                Err(RotationPrimitiveError::TimedOut(limit))
            }
        }
    }
}

/// Builds `keystone-manage` invocations run as the service user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoneManage {
    pub binary: String,
    pub user: String,
    pub group: String,
}

impl Default for KeystoneManage {
    fn default() -> Self {
        Self {
            binary: "keystone-manage".to_string(),
            user: "keystone".to_string(),
            group: "keystone".to_string(),
        }
    }
}

impl KeystoneManage {
    pub fn new(binary: impl Into<String>, user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            user: user.into(),
            group: group.into(),
        }
    }

    /// e.g. `keystone-manage fernet_rotate --keystone-user keystone --keystone-group keystone`
    pub fn command(&self, subcommand: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            subcommand.to_string(),
            "--keystone-user".to_string(),
            self.user.clone(),
            "--keystone-group".to_string(),
            self.group.clone(),
        ]
    }
}

/// Log a primitive failure with its full diagnostic output
pub(crate) fn log_primitive_failure(operation: &str, err: &RotationPrimitiveError) {
    match err {
        RotationPrimitiveError::Failed { exit_code, stderr } => {
            error!(operation = operation, exit_code = ?exit_code, "Key primitive failed. Stderr:");
            for line in stderr.lines() {
                error!(operation = operation, "    {}", line);
            }
        }
        other => error!(operation = operation, error = %other, "Key primitive failed"),
    }
}
