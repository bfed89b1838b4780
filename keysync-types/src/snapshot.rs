//! Cluster-wide key snapshot published by the leader

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, TypesError};
use crate::keys::{KeyEntry, KeyIndex, KeyPurpose, KeyRepository};

/// Serialized form stored in the peer store:
/// repository location → (index → key content)
pub type WireSnapshot = BTreeMap<String, BTreeMap<String, String>>;

/// Authoritative key material for the whole cluster.
///
/// Versioned by content: two snapshots are the same version when they hold
/// the same keys. Modification times are never part of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    repositories: BTreeMap<KeyPurpose, KeyRepository>,
}

impl ClusterSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from local repositories
    pub fn from_repositories(repositories: impl IntoIterator<Item = KeyRepository>) -> Self {
        let mut snapshot = Self::empty();
        for repository in repositories {
            snapshot.insert(repository);
        }
        snapshot
    }

    /// Add or replace the repository for its purpose
    pub fn insert(&mut self, repository: KeyRepository) {
        self.repositories
            .insert(repository.purpose, repository.without_timestamps());
    }

    pub fn repository(&self, purpose: KeyPurpose) -> Option<&KeyRepository> {
        self.repositories.get(&purpose)
    }

    pub fn repositories(&self) -> impl Iterator<Item = &KeyRepository> {
        self.repositories.values()
    }

    /// True when no key material has been published yet
    pub fn is_empty(&self) -> bool {
        self.repositories.values().all(KeyRepository::is_empty)
    }

    /// Total number of keys across all repositories
    pub fn key_count(&self) -> usize {
        self.repositories.values().map(KeyRepository::len).sum()
    }

    pub fn to_wire(&self) -> Result<WireSnapshot> {
        let mut wire = WireSnapshot::new();
        for repository in self.repositories.values() {
            let location = repository.purpose.repository_name().to_string();
            let mut keys = BTreeMap::new();
            for entry in repository.entries() {
                let content = String::from_utf8(entry.content.clone()).map_err(|_| {
                    TypesError::InvalidContent {
                        repository: location.clone(),
                        index: entry.index,
                    }
                })?;
                keys.insert(entry.index.to_string(), content);
            }
            wire.insert(location, keys);
        }
        Ok(wire)
    }

    pub fn from_wire(wire: WireSnapshot) -> Result<Self> {
        let mut snapshot = Self::empty();
        for (location, keys) in wire {
            let purpose = KeyPurpose::from_location(&location)
                .ok_or_else(|| TypesError::UnknownRepository(location.clone()))?;
            let mut repository = KeyRepository::new(purpose);
            for (index, content) in keys {
                let index: KeyIndex = index
                    .parse()
                    .map_err(|_| TypesError::InvalidIndex(format!("{}/{}", location, index)))?;
                repository.insert(KeyEntry::new(index, content.into_bytes()));
            }
            snapshot.insert(repository);
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_wire()?)?)
    }

    /// Parse a stored snapshot; an empty payload is an empty snapshot
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty());
        }
        let wire: WireSnapshot = serde_json::from_slice(payload)?;
        Self::from_wire(wire)
    }
}
