//! `tm_config` - Configuration parsing and validation for Tidemark
//!
//! This crate provides:
//! - TOML configuration parsing
//! - Default value handling
//! - Environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TmConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Change detection worker settings
    pub engine: EngineConfig,

    /// Bulk recalculation settings
    pub recalculation: RecalculationConfig,

    /// Missing-data watchdog settings
    pub watchdog: WatchdogConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Path to `DuckDB` database file
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default database path using XDG directories
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tidemark")
        .join("tidemark.duckdb")
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    path.to_path_buf()
}

impl GlobalConfig {
    pub fn expand_paths(&mut self) {
        self.db_path = expand_path(&self.db_path);
    }
}

/// Detection worker pool and upstream retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on work items executing at once across all tests
    pub workers: usize,

    /// How many times a labels event is requeued while its dataset is not visible
    pub visibility_retry_attempts: u32,

    /// Delay between requeues of a not-yet-visible dataset
    pub visibility_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_retry_attempts: 5,
            visibility_retry_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn visibility_retry_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_retry_delay_ms)
    }
}

/// Recalculation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalculationConfig {
    /// How long a finished recalculation stays visible to status polling
    pub grace_period_secs: u64,
}

impl Default for RecalculationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
        }
    }
}

impl RecalculationConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Missing-data watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Run the periodic staleness scan
    pub enabled: bool,

    /// Seconds between scans
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl TmConfig {
    /// Standard config file paths, in order of precedence
    #[must_use]
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("tidemark.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("tidemark").join("tidemark.toml"));
        }

        paths.push(PathBuf::from("/etc/tidemark/tidemark.toml"));

        paths
    }

    /// Discover and load configuration from standard paths.
    ///
    /// Returns defaults if no config file is found.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered config file cannot be loaded.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                info!(path = %path.display(), "Loading config from");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if config discovery or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides();
        config.global.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: TmConfig = toml::from_str(content)?;
        config.global.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `TM_*` overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TM_DB_PATH") {
            self.global.db_path = expand_path(&PathBuf::from(val));
        }
        if let Some(val) = lookup("TM_LOG_LEVEL") {
            self.global.log_level = val;
        }
        if let Some(val) = lookup("TM_WORKERS")
            && let Ok(workers) = val.parse()
        {
            self.engine.workers = workers;
        }
        if let Some(val) = lookup("TM_WATCHDOG_INTERVAL")
            && let Ok(secs) = val.parse()
        {
            self.watchdog.interval_secs = secs;
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 {
            return Err(ConfigError::ValidationError(
                "engine.workers must be > 0".to_string(),
            ));
        }

        if self.engine.visibility_retry_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.visibility_retry_delay_ms must be > 0".to_string(),
            ));
        }

        if self.watchdog.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog.interval_secs must be > 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Get watchdog interval as Duration
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.interval_secs)
    }
}
