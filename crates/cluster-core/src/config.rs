//! Cluster engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout of multi-node requests when the caller does not set one.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Silence after which a heartbeat is sent (default: 5s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is considered down (default: 10s)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Connection state recovery; disabled when absent
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long a disconnected session can be restored (default: 2 minutes)
    #[serde(default = "default_max_disconnection_duration")]
    pub max_disconnection_duration_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            recovery: None,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_disconnection_duration_ms: default_max_disconnection_duration(),
        }
    }
}

impl ClusterConfig {
    pub fn with_recovery(mut self) -> Self {
        self.recovery = Some(RecoveryConfig::default());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl RecoveryConfig {
    pub fn max_disconnection_duration(&self) -> Duration {
        Duration::from_millis(self.max_disconnection_duration_ms)
    }
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_max_disconnection_duration() -> u64 {
    120_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(10));
        assert!(config.recovery.is_none());
    }

    #[test]
    fn test_partial_json() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms": 100, "recovery": {}}"#).unwrap();
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(config.heartbeat_timeout_ms, 10_000);
        assert_eq!(
            config.recovery.unwrap().max_disconnection_duration(),
            Duration::from_secs(120)
        );
    }
}
