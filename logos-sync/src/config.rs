//! Configuration for every component of a collaboration session.
//!
//! Each struct has a `Default` carrying the documented defaults. All of them
//! deserialize from JSON with missing fields falling back to those defaults;
//! durations are expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflict::ResolutionStrategy;
use crate::error::ConfigError;
use crate::permissions::Role;

/// Socket connection and reconnection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Relay server URL, e.g. `ws://127.0.0.1:9090/doc-1`.
    pub url: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "millis")]
    pub reconnect_max_delay: Duration,
    /// Consecutive failed reconnects before giving up.
    pub max_reconnect_attempts: u32,
    #[serde(with = "millis")]
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Identity and pacing of the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub document_id: String,
    pub user_name: String,
    /// Generated when absent.
    pub client_id: Option<String>,
    /// Minimum spacing between outbound PRESENCE frames.
    #[serde(with = "millis")]
    pub presence_throttle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            document_id: String::new(),
            user_name: "Anonymous".to_string(),
            client_id: None,
            presence_throttle: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictConfig {
    pub strategy: ResolutionStrategy,
    /// Two operations whose counters differ by less than this are concurrent.
    pub concurrency_threshold: u64,
    /// Per-node history length.
    pub history_limit: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::RolePrecedence,
            concurrency_threshold: 100,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    #[serde(with = "millis")]
    pub default_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceConfig {
    #[serde(with = "millis")]
    pub cleanup_interval: Duration,
    #[serde(with = "millis")]
    pub expiration: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5),
            expiration: Duration::from_secs(30),
        }
    }
}

/// Everything needed to join one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Authenticated user id; authorship of local operations and lock holder.
    pub user_id: String,
    pub role: Role,
    pub transport: TransportConfig,
    pub sync: SyncConfig,
    pub conflict: ConflictConfig,
    pub locks: LockConfig,
    pub presence: PresenceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            role: Role::Viewer,
            transport: TransportConfig::default(),
            sync: SyncConfig::default(),
            conflict: ConflictConfig::default(),
            locks: LockConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Serde adapter: `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
