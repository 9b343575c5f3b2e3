//! Fundamental data vocabulary and source descriptors.
//!
//! Everything the change detector needs to know about an upstream feed lives
//! here: the fixed `DataType` vocabulary, the untyped `RawRecord` shape that
//! fetchers hand back, and the `SourceConfig` descriptor that declares which
//! fields carry timestamps, ids and values.
//!
//! # Data Sources
//! - **DataSource** trait: implemented by fetchers (HTTP fetchers live outside this crate)
//! - **JsonFileSource**: reads `<data_dir>/<asset>/<data_type>.json`

mod extract;
mod file_source;
mod provider;

pub use extract::{extract_value, extractor, parse_record_timestamp, record_id, Extractor};
pub use file_source::JsonFileSource;
pub use provider::{DataSource, SourceError};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One untyped record as returned by a fetcher.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Data Types
// ============================================================================

/// Fundamental data type vocabulary shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Earnings,
    Revenue,
    DebtRatio,
    ProfitMargin,
    Roe,
    EconomicIndicator,
    Guidance,
}

impl DataType {
    /// Every recognized data type.
    pub const ALL: [DataType; 7] = [
        Self::Earnings,
        Self::Revenue,
        Self::DebtRatio,
        Self::ProfitMargin,
        Self::Roe,
        Self::EconomicIndicator,
        Self::Guidance,
    ];

    /// Wire name (e.g. "debt_ratio").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earnings => "earnings",
            Self::Revenue => "revenue",
            Self::DebtRatio => "debt_ratio",
            Self::ProfitMargin => "profit_margin",
            Self::Roe => "roe",
            Self::EconomicIndicator => "economic_indicator",
            Self::Guidance => "guidance",
        }
    }

    /// How often a source of this type is checked unless overridden.
    pub fn default_check_interval(&self) -> Duration {
        match self {
            Self::EconomicIndicator => Duration::hours(1),
            Self::Earnings | Self::Revenue | Self::Guidance => Duration::hours(6),
            Self::DebtRatio | Self::ProfitMargin | Self::Roe => Duration::hours(24),
        }
    }

    /// Job priority unless overridden.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Earnings | Self::Guidance => Priority::High,
            Self::Revenue | Self::EconomicIndicator => Priority::Medium,
            Self::DebtRatio | Self::ProfitMargin | Self::Roe => Priority::Low,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s.trim())
            .ok_or_else(|| format!("unknown data type: {s}"))
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority; higher values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ============================================================================
// Assets
// ============================================================================

/// Broad asset class; decides which data types are collected by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Index,
    Forex,
    Commodity,
    Crypto,
}

impl AssetClass {
    /// Data types collected for this class when none are configured.
    pub fn default_data_types(&self) -> Vec<DataType> {
        match self {
            Self::Equity => DataType::ALL.to_vec(),
            Self::Index | Self::Forex | Self::Commodity | Self::Crypto => {
                vec![DataType::EconomicIndicator]
            }
        }
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "equity" | "stock" => Ok(Self::Equity),
            "index" => Ok(Self::Index),
            "forex" | "fx" => Ok(Self::Forex),
            "commodity" => Ok(Self::Commodity),
            "crypto" => Ok(Self::Crypto),
            other => Err(format!("unknown asset class: {other}")),
        }
    }
}

/// A tracked asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub name: String,
    pub asset_class: AssetClass,
}

// ============================================================================
// Source Descriptors
// ============================================================================

/// Identity of one (asset, data type) pair; keys cursors and jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub asset: String,
    pub data_type: DataType,
}

impl SourceKey {
    pub fn new(asset: impl Into<String>, data_type: DataType) -> Self {
        Self {
            asset: asset.into(),
            data_type,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset, self.data_type)
    }
}

/// Describes one upstream feed for an (asset, data type) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    /// Name recorded on snapshots
    pub name: String,
    pub asset: String,
    pub data_type: DataType,
    /// Field holding the record timestamp; enables timestamp detection
    pub timestamp_field: Option<String>,
    /// Field holding a stable record id; enables identifier detection
    pub id_field: Option<String>,
    /// Overrides the per-type extraction table
    pub value_field: Option<String>,
    pub check_frequency: Duration,
    pub priority: Priority,
}

impl SourceConfig {
    /// Descriptor with per-type defaults and content-hash detection.
    pub fn new(asset: impl Into<String>, data_type: DataType) -> Self {
        let asset = asset.into();
        Self {
            name: format!("{}:{}", asset, data_type),
            asset,
            data_type,
            timestamp_field: None,
            id_field: None,
            value_field: None,
            check_frequency: data_type.default_check_interval(),
            priority: data_type.default_priority(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    pub fn with_value_field(mut self, field: impl Into<String>) -> Self {
        self.value_field = Some(field.into());
        self
    }

    pub fn with_check_frequency(mut self, frequency: Duration) -> Self {
        self.check_frequency = frequency;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.asset.clone(), self.data_type)
    }
}

// ============================================================================
// Tests
// ============================================================================
