//! Configuration management for Zero services.
//!
//! All Zero services share a unified configuration file at `~/.codecoder/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (ZERO_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ZERO_LOG_LEVEL` → observability.log_level
//! - `ZERO_FUNDAMENTALS_DB` → fundamentals.storage.db_path
//! - `ZERO_FUNDAMENTALS_TICK_SECS` → fundamentals.tick_interval_secs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(
            || PathBuf::from(".codecoder"),
            |dirs| dirs.home_dir().join(".codecoder"),
        )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration structure for all Zero services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Fundamental data collection and bias scoring
    #[serde(default)]
    pub fundamentals: FundamentalsConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ZERO_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(path) = std::env::var("ZERO_FUNDAMENTALS_DB") {
            let expanded = shellexpand::tilde(&path).into_owned();
            self.fundamentals.storage.db_path = Some(expanded);
        }

        if let Ok(secs) = std::env::var("ZERO_FUNDAMENTALS_TICK_SECS") {
            if let Ok(s) = secs.parse() {
                self.fundamentals.tick_interval_secs = s;
            }
        }
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        self.fundamentals.validate()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to clamp to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Fundamentals Configuration
// ============================================================================

/// Fundamental data service configuration.
///
/// Data types are kept as plain strings here; the fundamentals service
/// resolves them against its fixed vocabulary at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalsConfig {
    /// Scheduler tick resolution in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Size of the worker pool used by the scheduler
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,

    /// Deadline for a single source fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Retries before a failing job falls back to its normal interval
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum snapshots read per asset when scoring
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,

    /// Per-asset request limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: FundamentalsStorageConfig,

    /// Directory read by the JSON file data source
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Tracked assets
    #[serde(default = "default_assets")]
    pub assets: Vec<AssetEntry>,

    /// Per-source overrides (field names, frequency, priority)
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_parallel_requests: default_max_parallel_requests(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            snapshot_limit: default_snapshot_limit(),
            rate_limit: RateLimitConfig::default(),
            storage: FundamentalsStorageConfig::default(),
            data_dir: None,
            assets: default_assets(),
            sources: Vec::new(),
        }
    }
}

impl FundamentalsConfig {
    /// Data directory with `~` expanded; defaults to `~/.codecoder/fundamentals`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
            .unwrap_or_else(|| config_dir().join("fundamentals"))
    }

    /// Validate the numeric limits and asset list.
    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(Error::Config("fundamentals.tick_interval_secs must be > 0".into()));
        }
        if self.max_parallel_requests == 0 {
            return Err(Error::Config(
                "fundamentals.max_parallel_requests must be > 0".into(),
            ));
        }
        if self.snapshot_limit == 0 {
            return Err(Error::Config("fundamentals.snapshot_limit must be > 0".into()));
        }
        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown fundamentals storage backend: {other}"
                )))
            }
        }
        if let Some(asset) = self.assets.iter().find(|a| a.symbol.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "asset '{}' has an empty symbol",
                asset.name
            )));
        }
        Ok(())
    }
}

/// Per-asset request limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundamentalsStorageConfig {
    /// Backend type (sqlite, memory)
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database path (for `SQLite`); defaults to `~/.codecoder/fundamentals.db`
    #[serde(default)]
    pub db_path: Option<String>,
}

impl Default for FundamentalsStorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            db_path: None,
        }
    }
}

impl FundamentalsStorageConfig {
    /// Resolved database path.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
            .unwrap_or_else(|| config_dir().join("fundamentals.db"))
    }
}

/// A tracked asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    /// equity, index, forex, commodity, crypto
    #[serde(default = "default_asset_class")]
    pub asset_class: String,
    /// Explicit data types; defaults depend on the asset class
    #[serde(default)]
    pub data_types: Option<Vec<String>>,
}

/// Override for the source of one (asset, data type) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceEntry {
    pub asset: String,
    pub data_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub value_field: Option<String>,
    #[serde(default)]
    pub check_frequency_secs: Option<u64>,
    /// low, medium, high, critical
    #[serde(default)]
    pub priority: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_max_parallel_requests() -> usize {
    4
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_snapshot_limit() -> usize {
    50
}
fn default_per_minute() -> u32 {
    10
}
fn default_per_hour() -> u32 {
    100
}
fn default_per_day() -> u32 {
    1000
}
fn default_storage_backend() -> String {
    "sqlite".into()
}
fn default_asset_class() -> String {
    "equity".into()
}

fn default_assets() -> Vec<AssetEntry> {
    [
        ("AAPL", "Apple Inc.", "equity"),
        ("MSFT", "Microsoft Corp.", "equity"),
        ("SPX", "S&P 500", "index"),
        ("EURUSD", "Euro / US Dollar", "forex"),
        ("XAUUSD", "Gold", "commodity"),
    ]
    .into_iter()
    .map(|(symbol, name, class)| AssetEntry {
        symbol: symbol.into(),
        name: name.into(),
        asset_class: class.into(),
        data_types: None,
    })
    .collect()
}
