//! Configuration management for keysync services

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of every keysync environment variable
pub const ENV_PREFIX: &str = "KEYSYNC";

/// Smallest value `max_active_keys` may take (staging + primary + one secondary)
pub const MIN_ACTIVE_KEYS: u32 = 3;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Console,
    Json,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Name of this node in log lines and in the peer store
    pub node_id: String,
    /// Static leadership flag, used when no external elector is wired in
    pub leader: bool,
    /// Token lifetime in seconds; zero or negative forces rotation every tick
    pub token_expiration: i64,
    pub max_active_keys: u32,
    /// Directory holding the key repositories and the key-setup sentinel
    pub key_root: PathBuf,
    pub key_owner_uid: Option<u32>,
    pub key_owner_gid: Option<u32>,
    pub keystone_user: String,
    pub keystone_group: String,
    /// Path of the `keystone-manage` executable
    pub keystone_manage: String,
    pub rotation_timeout_secs: u64,
    pub tick_interval_secs: u64,
    /// Run the one-time key repository setup on the leader
    pub bootstrap_keys: bool,
    pub nats_url: Option<String>,
    pub kv_bucket: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from an explicit environment source
    pub fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .set_default("node_id", default_node_id())?
            .set_default("leader", false)?
            .set_default("token_expiration", 3600_i64)?
            .set_default("max_active_keys", 3_i64)?
            .set_default("key_root", "/etc/keystone")?
            .set_default("keystone_user", "keystone")?
            .set_default("keystone_group", "keystone")?
            .set_default("keystone_manage", "keystone-manage")?
            .set_default("rotation_timeout_secs", 120_i64)?
            .set_default("tick_interval_secs", 300_i64)?
            .set_default("bootstrap_keys", true)?
            .set_default("kv_bucket", "keysync")?
            .set_default("log_level", "info")?
            .set_default("log_format", "console")?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the rotation policy cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_keys < MIN_ACTIVE_KEYS {
            return Err(ConfigError::Message(format!(
                "max_active_keys must be at least {} (got {})",
                MIN_ACTIVE_KEYS, self.max_active_keys
            )));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Message(
                "tick_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.rotation_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "rotation_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Message("node_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Owner applied to key directories and files, when both ids are set
    pub fn key_owner(&self) -> Option<(u32, u32)> {
        self.key_owner_uid.zip(self.key_owner_gid)
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}

fn default_node_id() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("keysync-{}", uuid::Uuid::new_v4()))
}
