//! Configuration file and registry settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::descriptor::{EnvironmentVariable, TargetDescriptor};

/// Current configuration file version
pub const CONFIG_VERSION: u32 = 1;

/// Idle reaper tick interval (ms)
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 5_000;
/// SSH keepalive interval (secs)
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
/// Remote-command `tty` discovery timeout (ms)
pub const DEFAULT_TTY_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

fn default_reaper_interval_ms() -> u64 {
    DEFAULT_REAPER_INTERVAL_MS
}

fn default_keepalive_interval_secs() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_tty_discovery_timeout_ms() -> u64 {
    DEFAULT_TTY_DISCOVERY_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// Settings for the connection registry and everything it spawns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// No timeout when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_tty_discovery_timeout_ms")]
    pub tty_discovery_timeout_ms: u64,

    /// Reconnect automatically when a transport dies with an error
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Environment applied to every session before descriptor overrides
    #[serde(default)]
    pub base_environment: Vec<EnvironmentVariable>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
            connect_timeout_secs: None,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            tty_discovery_timeout_ms: DEFAULT_TTY_DISCOVERY_TIMEOUT_MS,
            auto_reconnect: true,
            base_environment: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn tty_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.tty_discovery_timeout_ms)
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            registry: RegistryConfig::default(),
            targets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_registry_config_uses_defaults() {
        let cfg: RegistryConfig = serde_json::from_str(r#"{"reaperIntervalMs": 250}"#).unwrap();
        assert_eq!(cfg.reaper_interval(), Duration::from_millis(250));
        assert_eq!(cfg.connect_timeout(), None);
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.tty_discovery_timeout_ms, DEFAULT_TTY_DISCOVERY_TIMEOUT_MS);
    }
}
