//! Configuration management for Cairn
//!
//! Provides the daemon configuration with layered loading:
//! 1. Environment variables (CAIRN_* prefix, highest precedence)
//! 2. cairn.toml (per-deployment config file)
//! 3. Built-in defaults (lowest precedence)
//!
//! All durations are carried as integer milliseconds in the file and exposed
//! as [`std::time::Duration`] accessors.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Main Cairn daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub node: NodeConfig,
    pub timeouts: TimeoutConfig,
    pub rebalance: RebalanceConfig,
    pub broadcast: BroadcastConfig,
    pub log: LogConfig,
}

/// Identity and listen endpoints of this daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable daemon ID; generated on first start when empty.
    pub id: String,
    /// proxy | target
    pub role: String,
    pub public_addr: String,
    pub public_port: u16,
    pub control_port: u16,
    pub data_port: u16,
    /// Primary proxy URL used to join an existing cluster.
    pub join_url: String,
    /// Where persisted metadata snapshots live.
    pub meta_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            role: "target".to_string(),
            public_addr: "127.0.0.1".to_string(),
            public_port: 8080,
            control_port: 9080,
            data_port: 10080,
            join_url: String::new(),
            meta_dir: PathBuf::from("/var/lib/cairn"),
        }
    }
}

/// Control-plane timing knobs (milliseconds on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Base budget of one control-plane RPC.
    pub cplane_operation_ms: u64,
    /// Per-probe keepalive budget; also bounds metasync retry windows.
    pub max_keepalive_ms: u64,
    /// Sleep between a failed probe and its single retry.
    pub keepalive_retry_ms: u64,
    /// Stats collection period.
    pub stats_time_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cplane_operation_ms: 2_000,
            max_keepalive_ms: 4_000,
            keepalive_retry_ms: 1_000,
            stats_time_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn cplane_operation(&self) -> Duration {
        Duration::from_millis(self.cplane_operation_ms)
    }

    pub fn max_keepalive(&self) -> Duration {
        Duration::from_millis(self.max_keepalive_ms)
    }

    pub fn keepalive_retry(&self) -> Duration {
        Duration::from_millis(self.keepalive_retry_ms)
    }

    pub fn stats_time(&self) -> Duration {
        Duration::from_millis(self.stats_time_ms)
    }
}

/// Rebalance knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    pub enabled: bool,
    /// Budget for waiting on a destination target during a round.
    pub dest_retry_time_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_retry_time_ms: 2_000,
        }
    }
}

impl RebalanceConfig {
    pub fn dest_retry_time(&self) -> Duration {
        Duration::from_millis(self.dest_retry_time_ms)
    }
}

/// Fan-out limits for intra-cluster broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub max_parallel: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { max_parallel: 16 }
    }
}

/// Logging knobs, consumed by the daemon's tracing-subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter directive, e.g. "info" or "cairn_rebalance=debug,info".
    pub verbosity: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl CairnConfig {
    /// Sanity-checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.role != "proxy" && self.node.role != "target" {
            return Err(ConfigError::Validation(format!(
                "node.role must be \"proxy\" or \"target\", got {:?}",
                self.node.role
            )));
        }
        if self.broadcast.max_parallel == 0 {
            return Err(ConfigError::Validation(
                "broadcast.max_parallel must be >= 1".to_string(),
            ));
        }
        if self.timeouts.keepalive_retry_ms > self.timeouts.max_keepalive_ms {
            return Err(ConfigError::Validation(
                "timeouts.keepalive_retry_ms exceeds timeouts.max_keepalive_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        CairnConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_role_rejected() {
        let mut cfg = CairnConfig::default();
        cfg.node.role = "witness".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_must_fit_keepalive_window() {
        let mut cfg = CairnConfig::default();
        cfg.timeouts.keepalive_retry_ms = cfg.timeouts.max_keepalive_ms + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.cplane_operation(), Duration::from_millis(2_000));
        assert_eq!(cfg.keepalive_retry(), Duration::from_millis(1_000));
    }
}
