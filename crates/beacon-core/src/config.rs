//! Configuration system for Beacon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BEACON_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/beacon/config.toml
//!   3. ~/.config/beacon/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::AttributeMap;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Categories the daemon subscribes to at startup.
    pub subscribe: Vec<String>,
    /// Resources the daemon publishes at startup.
    pub publish: Vec<PublishEntry>,
    pub agent: AgentConfig,
    pub network: NetworkConfig,
}

/// Options recognised by the discovery agent itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Lifetime advertised with every publication. Peers drop a resource
    /// this long after its last announcement.
    pub resource_expiry_secs: u32,
    /// How long dispose waits for bye-bye sends to leave before stopping
    /// the transport.
    pub shutdown_flush_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name. Empty = let the OS choose.
    pub interface: String,
    /// UDP port every participant binds and sends to.
    pub port: u16,
    /// IPv6 multicast group used for broadcasts.
    pub multicast_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishEntry {
    pub category: String,
    pub connection: String,
    pub attributes: AttributeMap,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default advertised lifetime, in seconds.
pub const DEFAULT_RESOURCE_EXPIRY_SECS: u32 = 30;

/// Default UDP port for the multicast transport.
pub const DEFAULT_PORT: u16 = 45277;

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resource_expiry_secs: DEFAULT_RESOURCE_EXPIRY_SECS,
            shutdown_flush_ms: 50,
        }
    }
}

impl AgentConfig {
    pub fn shutdown_flush(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_ms)
    }

    /// Expiry as carried on the wire. Clamped so it never goes negative.
    pub fn wire_expiry_secs(&self) -> i32 {
        self.resource_expiry_secs.min(i32::MAX as u32) as i32
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: DEFAULT_PORT,
            multicast_addr: "ff02::1".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("beacon")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BeaconConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            BeaconConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BEACON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BeaconConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BEACON_* overrides. `lookup` stands in for the process env so
    /// tests do not have to mutate it.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BEACON_AGENT__RESOURCE_EXPIRY_SECS") {
            if let Ok(secs) = v.parse() {
                self.agent.resource_expiry_secs = secs;
            }
        }
        if let Some(v) = lookup("BEACON_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Some(v) = lookup("BEACON_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = lookup("BEACON_SUBSCRIBE") {
            self.subscribe = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}
