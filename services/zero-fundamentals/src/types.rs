//! Persistent records shared by the detector, the scorer and storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::data::{DataType, SourceKey};

// ============================================================================
// Snapshots and Cursors
// ============================================================================

/// One immutable observation of a fundamental data point.
///
/// Unique per `(asset, data_type, timestamp)`; never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalSnapshot {
    pub asset: String,
    pub data_type: DataType,
    pub value: f64,
    pub previous_value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Source descriptor name
    pub source: String,
    /// SHA-256 of the canonical raw record
    pub content_hash: String,
    pub change_detected: bool,
}

impl FundamentalSnapshot {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.asset.clone(), self.data_type)
    }
}

/// Per-source change detection checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDetectionCursor {
    pub asset: String,
    pub data_type: DataType,
    pub last_check_timestamp: DateTime<Utc>,
    pub last_data_timestamp: Option<DateTime<Utc>>,
    pub known_ids: BTreeSet<String>,
    pub content_hash: Option<String>,
    pub check_frequency: Duration,
    pub next_scheduled_check: DateTime<Utc>,
}

impl ChangeDetectionCursor {
    /// Empty cursor for a source that has never been checked.
    pub fn new(key: &SourceKey, check_frequency: Duration, now: DateTime<Utc>) -> Self {
        Self {
            asset: key.asset.clone(),
            data_type: key.data_type,
            last_check_timestamp: now,
            last_data_timestamp: None,
            known_ids: BTreeSet::new(),
            content_hash: None,
            check_frequency,
            next_scheduled_check: now,
        }
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.asset.clone(), self.data_type)
    }
}

// ============================================================================
// Bias
// ============================================================================

/// Five-level directional classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bias {
    StrongBullish,
    Bullish,
    Neutral,
    Bearish,
    StrongBearish,
}

impl Bias {
    /// Classify a weighted score. Boundaries are inclusive, checked top-down.
    pub fn from_weighted_score(score: f64) -> Self {
        if score >= 1.5 {
            Self::StrongBullish
        } else if score >= 0.5 {
            Self::Bullish
        } else if score >= -0.5 {
            Self::Neutral
        } else if score >= -1.5 {
            Self::Bearish
        } else {
            Self::StrongBearish
        }
    }

    /// Ordinal from -2 (strong bearish) to 2 (strong bullish).
    pub fn rank(&self) -> i8 {
        match self {
            Self::StrongBullish => 2,
            Self::Bullish => 1,
            Self::Neutral => 0,
            Self::Bearish => -1,
            Self::StrongBearish => -2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongBullish => "STRONG_BULLISH",
            Self::Bullish => "BULLISH",
            Self::Neutral => "NEUTRAL",
            Self::Bearish => "BEARISH",
            Self::StrongBearish => "STRONG_BEARISH",
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STRONG_BULLISH" => Ok(Self::StrongBullish),
            "BULLISH" => Ok(Self::Bullish),
            "NEUTRAL" => Ok(Self::Neutral),
            "BEARISH" => Ok(Self::Bearish),
            "STRONG_BEARISH" => Ok(Self::StrongBearish),
            other => Err(format!("unknown bias: {other}")),
        }
    }
}

/// Score of one factor within a `BiasScore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub name: String,
    pub data_type: DataType,
    pub score: f64,
    pub weight: u8,
}

/// Bias assessment for one asset at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasScore {
    pub asset: String,
    pub timestamp: DateTime<Utc>,
    pub factor_scores: Vec<FactorScore>,
    /// Unweighted sum of factor scores
    pub total_score: f64,
    pub weighted_score: f64,
    pub bias: Bias,
    /// In [0, 1]
    pub confidence: f64,
    pub bullish_factors: Vec<String>,
    pub bearish_factors: Vec<String>,
}

impl BiasScore {
    pub fn factor(&self, name: &str) -> Option<&FactorScore> {
        self.factor_scores.iter().find(|f| f.name == name)
    }
}
