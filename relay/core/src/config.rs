//! Relay Configuration
//!
//! Configuration is loaded from several sources. Priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! The default file location follows the XDG base directory layout:
//! `$XDG_CONFIG_HOME/resumable-relay/relay.toml`.
//!
//! # Example Configuration
//!
//! ```toml
//! [session]
//! idle_timeout_secs = 1800
//! sweep_interval_secs = 300
//! observer_channel_capacity = 256
//!
//! [producer]
//! pacing_ms = 100
//!
//! [server]
//! listen_addr = "127.0.0.1:3001"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::producer::DEFAULT_PACING;

/// Idle time after which a finished, unobserved session is evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Period of the eviction sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Buffered chunks per observer before it counts as too slow
pub const DEFAULT_OBSERVER_CHANNEL_CAPACITY: usize = 256;

/// Address the daemon listens on
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3001";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration last got a value from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Built-in defaults only
    #[default]
    Default,
    /// TOML configuration file
    File,
    /// Environment variables
    Env,
    /// Command-line arguments
    Cli,
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Idle timeout in seconds
    pub idle_timeout_secs: Option<u64>,
    /// Sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,
    /// Per-observer channel capacity
    pub observer_channel_capacity: Option<usize>,
}

/// `[producer]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerToml {
    /// Delay before each simulated word, in milliseconds
    pub pacing_ms: Option<u64>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address, e.g. `127.0.0.1:3001`
    pub listen_addr: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Session lifecycle section
    pub session: SessionToml,
    /// Producer section
    pub producer: ProducerToml,
    /// Server section
    pub server: ServerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective relay configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Idle time before a finished, unobserved session is evicted
    pub idle_timeout: Duration,
    /// Period of the eviction sweep
    pub sweep_interval: Duration,
    /// Delay before each word of the simulated producer
    pub pacing: Duration,
    /// Per-observer channel capacity
    pub observer_channel_capacity: usize,
    /// Daemon listen address
    pub listen_addr: String,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            pacing: DEFAULT_PACING,
            observer_channel_capacity: DEFAULT_OBSERVER_CHANNEL_CAPACITY,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `RELAY_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_config(&mut config, |key| std::env::var(key).ok());
        config
    }

    /// Set how long a finished, unobserved session is kept
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the period of the idle sweep
    #[must_use]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the simulated producer's delay between words
    #[must_use]
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the relay cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.observer_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "observer channel capacity must be greater than zero".to_string(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/resumable-relay/relay.toml`, or `None` when no
/// config directory can be determined.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("resumable-relay").join("relay.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
/// A missing file is not an error. The result is not validated, so CLI
/// overrides can still replace bad values; call [`RelayConfig::validate`]
/// once every layer is applied.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed. Validation is left
/// to the caller, as with [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(secs) = toml.session.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(capacity) = toml.session.observer_channel_capacity {
        config.observer_channel_capacity = capacity;
    }
    if let Some(ms) = toml.producer.pacing_ms {
        config.pacing = Duration::from_millis(ms);
    }
    if let Some(ref addr) = toml.server.listen_addr {
        config.listen_addr.clone_from(addr);
    }
}

/// Apply `RELAY_*` overrides; unparseable values are ignored with a warning
fn apply_env_config<F>(config: &mut RelayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parse_u64 = |key: &str| -> Option<u64> {
        let raw = env(key)?;
        match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "Ignoring unparseable environment value");
                None
            }
        }
    };

    if let Some(secs) = parse_u64("RELAY_IDLE_TIMEOUT_SECS") {
        config.idle_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parse_u64("RELAY_SWEEP_INTERVAL_SECS") {
        config.sweep_interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parse_u64("RELAY_PACING_MS") {
        config.pacing = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = parse_u64("RELAY_OBSERVER_CHANNEL_CAPACITY") {
        config.observer_channel_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = env("RELAY_LISTEN_ADDR") {
        config.listen_addr = addr;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Idle timeout override (seconds)
    pub idle_timeout_secs: Option<u64>,
    /// Sweep interval override (seconds)
    pub sweep_interval_secs: Option<u64>,
    /// Pacing override (milliseconds)
    pub pacing_ms: Option<u64>,
    /// Listen address override
    pub listen_addr: Option<String>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Set sweep interval override
    #[must_use]
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = Some(secs);
        self
    }

    /// Set pacing override
    #[must_use]
    pub fn with_pacing_ms(mut self, ms: u64) -> Self {
        self.pacing_ms = Some(ms);
        self
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.idle_timeout_secs.is_some()
            || self.sweep_interval_secs.is_some()
            || self.pacing_ms.is_some()
            || self.listen_addr.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = self.pacing_ms {
            config.pacing = Duration::from_millis(ms);
        }
        if let Some(ref addr) = self.listen_addr {
            config.listen_addr.clone_from(addr);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
