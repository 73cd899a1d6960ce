//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/quiesce/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/quiesce/` (~/.config/quiesce/)
//! - Data: `$XDG_DATA_HOME/quiesce/` (~/.local/share/quiesce/)
//! - State/Logs: `$XDG_STATE_HOME/quiesce/` (~/.local/state/quiesce/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Key used for the persisted batch when none is configured
pub const DEFAULT_STORAGE_KEY: &str = "quiesce:pending";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Collector behaviour
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where a collector mirrors its pending batch.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// No persistence, the batch lives only in memory
    #[default]
    Memory,
    /// Durable SQLite file that survives process restarts
    Local,
    /// Process-wide store shared by every collector in this process
    Session,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Memory => "memory",
            StorageType::Local => "local",
            StorageType::Session => "session",
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StorageType::Memory),
            "local" => Ok(StorageType::Local),
            "session" => Ok(StorageType::Session),
            other => Err(Error::Config(format!(
                "unknown storage type '{}' (expected memory, local or session)",
                other
            ))),
        }
    }
}

/// Collector configuration
///
/// All values are consumed once when a collector is built.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Quiescence delay before a pending batch is flushed
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Restart the delay on every push (quiet period) instead of keeping
    /// the first schedule (fixed window)
    #[serde(default = "default_true")]
    pub reset_timer_on_push: bool,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageType,

    /// Key of the pending batch within the backend
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Drain buffer and storage when the timer flushes
    #[serde(default = "default_true")]
    pub auto_clear: bool,

    /// SQLite file for `local` storage (defaults to the data dir)
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            reset_timer_on_push: true,
            storage: StorageType::Memory,
            storage_key: default_storage_key(),
            auto_clear: true,
            storage_path: None,
        }
    }
}

impl CollectorConfig {
    /// Memory-only config with the given delay and defaults elsewhere
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.delay_ms == 0 {
            return Err(Error::Config(
                "collector.delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.storage_key.is_empty() {
            return Err(Error::Config(
                "collector.storage_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// SQLite file used by `local` storage
    pub fn resolved_storage_path(&self) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(Config::store_path)
    }
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.collector.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/quiesce/config.toml` (~/.config/quiesce/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("quiesce").join("config.toml")
    }

    /// Returns the data directory path (for the durable store)
    ///
    /// `$XDG_DATA_HOME/quiesce/` (~/.local/share/quiesce/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("quiesce")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/quiesce/` (~/.local/state/quiesce/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("quiesce")
    }

    /// Returns the durable store file path
    ///
    /// `$XDG_DATA_HOME/quiesce/store.db` (~/.local/share/quiesce/store.db)
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }
}
