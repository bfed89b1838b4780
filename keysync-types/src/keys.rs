//! Key repository definitions
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Position of a key inside its repository
pub type KeyIndex = u32;

/// Index of the staging key (newest key, not yet primary)
pub const STAGING_INDEX: KeyIndex = 0;

/// What a key repository is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    /// Fernet token signing keys, rotated periodically
    TokenSigning,
    /// Credential encryption keys, never rotated by keysync
    CredentialEncryption,
}

impl KeyPurpose {
    /// Every repository keysync manages, in publish order
    pub const ALL: [KeyPurpose; 2] = [KeyPurpose::TokenSigning, KeyPurpose::CredentialEncryption];

    /// Directory name of the repository under the key root
    pub fn repository_name(&self) -> &'static str {
        match self {
            KeyPurpose::TokenSigning => "fernet-keys",
            KeyPurpose::CredentialEncryption => "credential-keys",
        }
    }

    /// Resolve a repository location string.
    ///
    /// Accepts the bare directory name (`fernet-keys`) as well as a full
    /// path such as `/etc/keystone/fernet-keys/`.
    pub fn from_location(location: &str) -> Option<Self> {
        let name = location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();

        Self::ALL.into_iter().find(|p| p.repository_name() == name)
    }

    /// Whether the rotation engine is allowed to rotate this repository
    pub fn is_rotated(&self) -> bool {
        matches!(self, KeyPurpose::TokenSigning)
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.repository_name())
    }
}

/// A single key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub index: KeyIndex,
    pub content: Vec<u8>,
    /// Modification time on local storage; `None` once published
    pub last_modified: Option<DateTime<Utc>>,
}

impl KeyEntry {
    pub fn new(index: KeyIndex, content: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            content: content.into(),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn is_staging(&self) -> bool {
        self.index == STAGING_INDEX
    }
}

/// All keys of one purpose, keyed by index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRepository {
    pub purpose: KeyPurpose,
    entries: BTreeMap<KeyIndex, KeyEntry>,
}

impl KeyRepository {
    pub fn new(purpose: KeyPurpose) -> Self {
        Self {
            purpose,
            entries: BTreeMap::new(),
        }
    }

    /// Insert or replace an entry, returning the previous one
    pub fn insert(&mut self, entry: KeyEntry) -> Option<KeyEntry> {
        self.entries.insert(entry.index, entry)
    }

    pub fn get(&self, index: KeyIndex) -> Option<&KeyEntry> {
        self.entries.get(&index)
    }

    /// The staging key, if the repository has been initialized
    pub fn staging(&self) -> Option<&KeyEntry> {
        self.get(STAGING_INDEX)
    }

    pub fn contains(&self, index: KeyIndex) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values()
    }

    pub fn indices(&self) -> impl Iterator<Item = KeyIndex> + '_ {
        self.entries.keys().copied()
    }

    /// Copy of this repository with local modification times dropped.
    ///
    /// Published snapshots compare by content only.
    pub fn without_timestamps(&self) -> Self {
        Self {
            purpose: self.purpose,
            entries: self
                .entries
                .iter()
                .map(|(index, entry)| (*index, KeyEntry::new(*index, entry.content.clone())))
                .collect(),
        }
    }

    /// Indices that must be dropped to respect `max_active_keys`.
    ///
    /// Only token-signing repositories are bounded. The oldest secondary keys
    /// (lowest non-zero index) go first; the staging key is never selected.
    pub fn excess_keys(&self, max_active_keys: usize) -> Vec<KeyIndex> {
        if !self.purpose.is_rotated() || self.entries.len() <= max_active_keys {
            return Vec::new();
        }

        let excess = self.entries.len() - max_active_keys;
        self.indices()
            .filter(|index| *index != STAGING_INDEX)
            .take(excess)
            .collect()
    }
}
