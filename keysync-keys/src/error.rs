//! Error types for key lifecycle management
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


use peer_store_client::SyncError;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Local key storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Key location missing: {0}")]
    LocationMissing(PathBuf),

    #[error("Not a key directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::LocationMissing(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_path_buf()),
            _ => StorageError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Failures of an external key primitive (`keystone-manage ...`)
#[derive(Error, Debug)]
pub enum RotationPrimitiveError {
    #[error("Command exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Failed to spawn command: {0}")]
    Spawn(String),
}

impl RotationPrimitiveError {
    /// Standard error text, empty when the process never ran to completion
    pub fn stderr(&self) -> &str {
        match self {
            RotationPrimitiveError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Key lifecycle errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Key rotation error: {0}")]
    Rotation(#[from] RotationPrimitiveError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
