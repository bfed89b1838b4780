//! Wiring a node from configuration
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


use anyhow::{Context, Result};
use chrono::Utc;
use keysync_config::AppConfig;
use keysync_keys::{
    fingerprint, KeyBootstrapper, KeyResult, KeyStorage, KeystoneManage, KeystoneManageRotator,
    LocalKeyStorage, RotationEngine, RotationPolicy, SyncAgent, TokioProcessExecutor,
};
use keysync_types::{KeyPurpose, KeyRepository};
use peer_store_client::{
    ClusterKeyStore, LeaderElection, LeadershipFlag, MemoryClusterStore, NatsClusterStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::coordinator::KeyCoordinator;
use crate::retry::{retry_with_backoff, RetryConfig};

/// A fully wired node
pub struct Node {
    pub coordinator: Arc<KeyCoordinator>,
    pub store: Arc<dyn ClusterKeyStore>,
    pub storage: Arc<LocalKeyStorage>,
    pub leadership: LeadershipFlag,
}

pub fn rotation_policy(config: &AppConfig) -> KeyResult<RotationPolicy> {
    RotationPolicy::new(config.token_expiration, config.max_active_keys)
}

pub fn local_storage(config: &AppConfig) -> LocalKeyStorage {
    let storage = LocalKeyStorage::new(&config.key_root);
    match config.key_owner() {
        Some((uid, gid)) => storage.with_owner(uid, gid),
        None => storage,
    }
}

pub fn keystone_manage(config: &AppConfig) -> KeystoneManage {
    KeystoneManage::new(
        config.keystone_manage.clone(),
        config.keystone_user.clone(),
        config.keystone_group.clone(),
    )
}

/// NATS when configured, otherwise a private in-memory store
pub async fn connect_store(
    config: &AppConfig,
    leadership: Arc<dyn LeaderElection>,
) -> Result<Arc<dyn ClusterKeyStore>> {
    let Some(url) = config.nats_url.as_deref() else {
        warn!("KEYSYNC_NATS_URL not set, running standalone with an in-memory peer store");
        let store = MemoryClusterStore::standalone(config.node_id.clone(), leadership).await;
        return Ok(Arc::new(store));
    };

    let store = retry_with_backoff(&RetryConfig::default(), "connect peer store", || {
        NatsClusterStore::connect(url, &config.kv_bucket, config.node_id.clone(), leadership.clone())
    })
    .await
    .context("Failed to connect to the peer store")?;

    Ok(Arc::new(store))
}

/// Build every component of a node from configuration
pub async fn build(config: &AppConfig) -> Result<Node> {
    let leadership = LeadershipFlag::new(config.leader);
    let election: Arc<dyn LeaderElection> = Arc::new(leadership.clone());

    let storage = Arc::new(local_storage(config));
    let store = connect_store(config, Arc::clone(&election)).await?;
    let executor = Arc::new(TokioProcessExecutor);
    let manage = keystone_manage(config);

    let rotator = Arc::new(KeystoneManageRotator::new(
        executor.clone(),
        manage.clone(),
        config.rotation_timeout(),
    ));
    let policy = rotation_policy(config).context("Invalid rotation policy")?;
    let engine = RotationEngine::new(storage.clone(), Arc::clone(&store), rotator, policy);
    let sync = SyncAgent::new(storage.clone(), Arc::clone(&store));

    let mut coordinator = KeyCoordinator::new(config.node_id.clone(), election, engine, sync);
    if config.bootstrap_keys {
        coordinator = coordinator.with_bootstrapper(KeyBootstrapper::new(
            executor,
            manage,
            config.rotation_timeout(),
            storage.clone(),
        ));
    }

    info!(
        node_id = %config.node_id,
        leader = config.leader,
        store = store.store_type(),
        key_root = %config.key_root.display(),
        rotation_interval = policy.rotation_interval_secs(),
        "Node initialized"
    );

    Ok(Node {
        coordinator: Arc::new(coordinator),
        store,
        storage,
        leadership,
    })
}

fn describe(repository: &KeyRepository, with_age: bool) -> Value {
    let keys: serde_json::Map<String, Value> = repository
        .entries()
        .map(|entry| (entry.index.to_string(), json!(fingerprint(&entry.content))))
        .collect();

    let mut description = json!({ "count": repository.len(), "keys": keys });
    if with_age {
        let age = repository
            .staging()
            .and_then(|staging| staging.last_modified)
            .map(|modified| (Utc::now() - modified).num_seconds());
        description["staging_age_secs"] = json!(age);
    }
    description
}

/// Local repositories and the published snapshot, as printed by `status`
pub async fn status_report(storage: &dyn KeyStorage, store: &dyn ClusterKeyStore) -> Result<Value> {
    let mut local = serde_json::Map::new();
    for purpose in KeyPurpose::ALL {
        let repository = storage.read_all(purpose).await?;
        local.insert(purpose.repository_name().to_string(), describe(&repository, true));
    }

    let snapshot = store.read().await?;
    let published: serde_json::Map<String, Value> = snapshot
        .repositories()
        .map(|repository| {
            (
                repository.purpose.repository_name().to_string(),
                describe(repository, false),
            )
        })
        .collect();

    Ok(json!({
        "initialized": storage.is_initialized().await?,
        "local": local,
        "published": published,
        "store": store.store_type(),
    }))
}
