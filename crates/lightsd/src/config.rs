//! Engine configuration.
//!
//! Loaded from an optional TOML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration.
//!
//! ```toml
//! listen = "0.0.0.0:56700"
//! broadcast = "255.255.255.255:56700"
//! device_timeout_ms = 3000
//! power_retransmit_delay_ms = 400
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lifx_core::Millis;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV_VAR: &str = "LIGHTSD_CONFIG";

/// Upper bound for the device timeout.
pub const MAX_DEVICE_TIMEOUT_MS: Millis = 20_000;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Engine Configuration
// ============================================================================

/// Tunables of the device protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Local address the UDP socket binds to.
    pub listen: SocketAddr,

    /// Where discovery broadcasts are sent.
    pub broadcast: SocketAddr,

    /// Bulbs silent for this long, and gateways lagging this much, are closed.
    pub device_timeout_ms: Millis,

    /// Gateways lagging this much get a forced refresh.
    pub force_refresh_ms: Millis,

    pub watchdog_interval_ms: Millis,

    /// Discovery interval while no gateway is known.
    pub active_discovery_interval_ms: Millis,

    /// Discovery interval once at least one gateway is known.
    pub passive_discovery_interval_ms: Millis,

    /// Lower bound between two refreshes of the same gateway.
    pub min_refresh_interval_ms: Millis,

    /// How long to wait before re-sending a power change the bulb did not apply.
    pub power_retransmit_delay_ms: Millis,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], lifx_protocol::PROTOCOL_PORT)),
            broadcast: SocketAddr::from(([255, 255, 255, 255], lifx_protocol::PROTOCOL_PORT)),
            device_timeout_ms: 3000,
            force_refresh_ms: 2000,
            watchdog_interval_ms: 500,
            active_discovery_interval_ms: 2000,
            passive_discovery_interval_ms: 10_000,
            min_refresh_interval_ms: 200,
            power_retransmit_delay_ms: 400,
        }
    }
}

impl EngineConfig {
    /// Default config file location: `$XDG_CONFIG_HOME/lightsd/lightsd.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lightsd").join("lightsd.toml"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &contents)
    }

    /// Resolves which file to load.
    ///
    /// An explicit path must exist. Otherwise `LIGHTSD_CONFIG` is consulted,
    /// then the default location; a missing default file means defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks the cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_timeout_ms > MAX_DEVICE_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "device_timeout_ms must be at most {MAX_DEVICE_TIMEOUT_MS} (got {})",
                self.device_timeout_ms
            )));
        }
        if self.device_timeout_ms <= self.force_refresh_ms {
            return Err(ConfigError::Invalid(format!(
                "device_timeout_ms ({}) must be greater than force_refresh_ms ({})",
                self.device_timeout_ms, self.force_refresh_ms
            )));
        }
        for (name, value) in [
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("active_discovery_interval_ms", self.active_discovery_interval_ms),
            ("passive_discovery_interval_ms", self.passive_discovery_interval_ms),
            ("min_refresh_interval_ms", self.min_refresh_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must not be zero")));
            }
        }
        Ok(())
    }
}
