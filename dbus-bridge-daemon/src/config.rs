//! Daemon Configuration
//!
//! Configuration management for the D-Bus bridge daemon. The file lives in
//! `<config_dir>/dbus-bridge/bridge.toml` unless a path is given on the
//! command line, and is written with defaults on first start.

use anyhow::{Context, Result};
use dbus_bridge_core::dispatcher::DEFAULT_CACHE_CAPACITY;
use dbus_bridge_core::{BridgeOptions, DEFAULT_BRIDGE_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which message bus the bridge attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusKind,

    /// Upper bound for every D-Bus call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Transient object handles kept for ad-hoc calls (0 = unbounded)
    #[serde(default = "default_cache_capacity")]
    pub object_cache_capacity: usize,

    /// Subscribe to signals of registered objects and raise them as events
    #[serde(default = "default_true")]
    pub listen_for_signals: bool,

    /// Property names skipped when every interface of an object is added
    ///
    /// For example: ["Secrets", "Password"]
    #[serde(default)]
    pub property_blacklist: Vec<String>,

    /// Name of the bridge data object on the management bus
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
}

fn default_call_timeout() -> u64 {
    10
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusKind::default(),
            call_timeout_secs: default_call_timeout(),
            object_cache_capacity: default_cache_capacity(),
            listen_for_signals: true,
            property_blacklist: Vec::new(),
            bridge_name: default_bridge_name(),
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("dbus-bridge")
            .join("bridge.toml")
    }

    /// Load configuration from `path`, creating it with defaults if missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            tracing::debug!("Loaded configuration from {}", path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Dispatcher settings derived from this file
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            bridge_name: self.bridge_name.clone(),
            listen_for_signals: self.listen_for_signals,
            property_blacklist: self.property_blacklist.clone(),
            object_cache_capacity: self.object_cache_capacity,
        }
    }
}
