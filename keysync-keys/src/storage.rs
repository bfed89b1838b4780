//! Local key repository storage
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
use chrono::{DateTime, Utc};
use keysync_types::{KeyEntry, KeyIndex, KeyPurpose, KeyRepository};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// File marking that key material on this node is ready to be read
pub const KEY_SETUP_FILE: &str = "key-setup";

const DIRECTORY_MODE: u32 = 0o700;
const KEY_FILE_MODE: u32 = 0o600;

/// Short, non-reversible identifier of key material for log lines
pub fn fingerprint(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    hex::encode(&digest[..6])
}

/// Durable per-node storage of key repositories
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Create the repository location if absent; success if present
    async fn ensure_location(&self, purpose: KeyPurpose) -> Result<(), StorageError>;

    /// Every entry currently stored; a missing location is an empty repository
    async fn read_all(&self, purpose: KeyPurpose) -> Result<KeyRepository, StorageError>;

    /// Overwrite an entry only when its bytes differ. Returns whether it wrote.
    async fn write_if_changed(
        &self,
        purpose: KeyPurpose,
        index: KeyIndex,
        content: &[u8],
    ) -> Result<bool, StorageError>;

    /// Delete an entry. Returns whether it existed.
    async fn remove(&self, purpose: KeyPurpose, index: KeyIndex) -> Result<bool, StorageError>;

    /// Whether the key-setup sentinel is present
    async fn is_initialized(&self) -> Result<bool, StorageError>;

    /// Write the key-setup sentinel
    async fn mark_initialized(&self) -> Result<(), StorageError>;
}

/// Key repositories as directories of index-named files
///
/// ```text
/// <root>/fernet-keys/0        staging key
/// <root>/fernet-keys/1..N     primary and secondary keys
/// <root>/credential-keys/0..N
/// <root>/key-setup            sentinel
/// ```
pub struct LocalKeyStorage {
    root: PathBuf,
    owner: Option<(u32, u32)>,
    writes: AtomicU64,
}

impl LocalKeyStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            owner: None,
            writes: AtomicU64::new(0),
        }
    }

    /// Chown created directories and key files to `uid:gid`
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository_path(&self, purpose: KeyPurpose) -> PathBuf {
        self.root.join(purpose.repository_name())
    }

    pub fn key_path(&self, purpose: KeyPurpose, index: KeyIndex) -> PathBuf {
        self.repository_path(purpose).join(index.to_string())
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.root.join(KEY_SETUP_FILE)
    }

    /// Number of key files physically written by this instance
    pub fn physical_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn apply_owner(&self, path: &Path) -> Result<(), StorageError> {
        #[cfg(unix)]
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(path, Some(uid), Some(gid))
                .map_err(|e| StorageError::from_io(path, e))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Write to a temporary sibling, then rename over the target
    async fn write_atomically(&self, path: &Path, content: &[u8]) -> Result<(), StorageError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("key");
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        let result = async {
            fs::write(&tmp, content)
                .await
                .map_err(|e| StorageError::from_io(&tmp, e))?;
            set_mode(&tmp, KEY_FILE_MODE).await?;
            self.apply_owner(&tmp)?;
            fs::rename(&tmp, path)
                .await
                .map_err(|e| StorageError::from_io(path, e))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| StorageError::from_io(path, e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}

/// Parse a key file name; only plain decimal names are keys
fn parse_index(name: &str) -> Option<KeyIndex> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[async_trait]
impl KeyStorage for LocalKeyStorage {
    async fn ensure_location(&self, purpose: KeyPurpose) -> Result<(), StorageError> {
        let path = self.repository_path(purpose);

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => return Ok(()),
            Ok(_) => return Err(StorageError::NotADirectory(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(&path, e)),
        }

        info!(path = %path.display(), "Creating key repository");

        fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        set_mode(&path, DIRECTORY_MODE).await?;
        self.apply_owner(&path)
    }

    async fn read_all(&self, purpose: KeyPurpose) -> Result<KeyRepository, StorageError> {
        let path = self.repository_path(purpose);
        let mut repository = KeyRepository::new(purpose);

        let mut dir = match fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(repository = %purpose, "Key repository not initialized yet");
                return Ok(repository);
            }
            Err(e) => return Err(StorageError::from_io(&path, e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(&path, e))?
        {
            let Some(index) = entry.file_name().to_str().and_then(parse_index) else {
                continue;
            };
            let file_path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                // Replaced or removed between listing and reading
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::from_io(&file_path, e)),
            };
            let content = match fs::read(&file_path).await {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::from_io(&file_path, e)),
            };
            let modified: DateTime<Utc> = metadata
                .modified()
                .map_err(|e| StorageError::from_io(&file_path, e))?
                .into();

            repository.insert(KeyEntry::new(index, content).with_last_modified(modified));
        }

        debug!(repository = %purpose, keys = repository.len(), "Read key repository");
        Ok(repository)
    }

    async fn write_if_changed(
        &self,
        purpose: KeyPurpose,
        index: KeyIndex,
        content: &[u8],
    ) -> Result<bool, StorageError> {
        let path = self.key_path(purpose, index);

        match fs::read(&path).await {
            Ok(existing) if existing == content => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(&path, e)),
        }

        self.write_atomically(&path, content).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        debug!(
            repository = %purpose,
            index = index,
            fingerprint = %fingerprint(content),
            "Key written"
        );
        Ok(true)
    }

    async fn remove(&self, purpose: KeyPurpose, index: KeyIndex) -> Result<bool, StorageError> {
        let path = self.key_path(purpose, index);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(repository = %purpose, index = index, "Key removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(&path, e)),
        }
    }

    async fn is_initialized(&self) -> Result<bool, StorageError> {
        let path = self.sentinel_path();
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(&path, e)),
        }
    }

    async fn mark_initialized(&self) -> Result<(), StorageError> {
        if self.is_initialized().await? {
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::from_io(&self.root, e))?;

        let path = self.sentinel_path();
        fs::write(&path, b"")
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        if let Err(e) = self.apply_owner(&path) {
            warn!(error = %e, "Failed to chown key-setup sentinel");
        }

        info!(path = %path.display(), "Key material marked as initialized");
        Ok(())
    }
}
