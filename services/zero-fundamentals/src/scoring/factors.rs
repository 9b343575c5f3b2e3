//! Fundamental factor definitions and per-factor scoring.

use serde::{Deserialize, Serialize};

use crate::data::DataType;
use crate::types::FundamentalSnapshot;

/// Whether higher values are good (`Positive`) or bad (`Negative`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(&self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

/// Six ordered cut points.
///
/// For positive factors they descend from `strong_bullish` to
/// `strong_bearish`; for negative factors they ascend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub strong_bullish: f64,
    pub bullish: f64,
    pub neutral_high: f64,
    pub neutral_low: f64,
    pub bearish: f64,
    pub strong_bearish: f64,
}

impl Thresholds {
    pub const fn new(values: [f64; 6]) -> Self {
        Self {
            strong_bullish: values[0],
            bullish: values[1],
            neutral_high: values[2],
            neutral_low: values[3],
            bearish: values[4],
            strong_bearish: values[5],
        }
    }

    fn as_array(&self) -> [f64; 6] {
        [
            self.strong_bullish,
            self.bullish,
            self.neutral_high,
            self.neutral_low,
            self.bearish,
            self.strong_bearish,
        ]
    }

    /// Cut points are monotonic in the direction implied by `polarity`.
    pub fn is_ordered(&self, polarity: Polarity) -> bool {
        let values = self.as_array();
        values.windows(2).all(|pair| match polarity {
            Polarity::Positive => pair[0] >= pair[1],
            Polarity::Negative => pair[0] <= pair[1],
        })
    }
}

/// One weighted input to the bias composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDefinition {
    pub name: String,
    /// 1, 2 or 3
    pub weight: u8,
    pub data_type: DataType,
    pub polarity: Polarity,
    pub thresholds: Thresholds,
}

impl FactorDefinition {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        weight: u8,
        polarity: Polarity,
        thresholds: [f64; 6],
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            data_type,
            polarity,
            thresholds: Thresholds::new(thresholds),
        }
    }

    /// Level score in {-2, -1, 0, 1, 2}.
    pub fn absolute_score(&self, value: f64) -> f64 {
        let t = &self.thresholds;
        match self.polarity {
            Polarity::Positive => {
                if value >= t.strong_bullish {
                    2.0
                } else if value >= t.bullish {
                    1.0
                } else if value <= t.strong_bearish {
                    -2.0
                } else if value <= t.bearish {
                    -1.0
                } else {
                    0.0
                }
            }
            Polarity::Negative => {
                if value <= t.strong_bullish {
                    2.0
                } else if value <= t.bullish {
                    1.0
                } else if value >= t.strong_bearish {
                    -2.0
                } else if value >= t.bearish {
                    -1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Momentum score from the percentage change against `previous`.
    ///
    /// A zero previous value has no defined percentage and scores 0.
    pub fn change_score(&self, current: f64, previous: f64) -> f64 {
        if previous == 0.0 {
            return 0.0;
        }
        let pct = (current - previous) / previous.abs() * 100.0;
        let magnitude = match pct.abs() {
            m if m >= 20.0 => 2.0,
            m if m >= 10.0 => 1.0,
            m if m >= 5.0 => 0.5,
            _ => 0.0,
        };
        magnitude * pct.signum() * self.polarity.sign()
    }

    /// Final factor score for the latest snapshot of this factor's data type.
    pub fn score(&self, snapshot: &FundamentalSnapshot) -> f64 {
        let absolute = self.absolute_score(snapshot.value);
        match (snapshot.change_detected, snapshot.previous_value) {
            (true, Some(previous)) => {
                let change = self.change_score(snapshot.value, previous);
                (0.7 * change + 0.3 * absolute).round()
            }
            _ => absolute.round(),
        }
    }
}

/// Check weights and threshold ordering.
pub fn validate_factors(factors: &[FactorDefinition]) -> Result<(), String> {
    for factor in factors {
        if !(1..=3).contains(&factor.weight) {
            return Err(format!(
                "factor '{}' has weight {}, expected 1-3",
                factor.name, factor.weight
            ));
        }
        if !factor.thresholds.is_ordered(factor.polarity) {
            return Err(format!("factor '{}' has unordered thresholds", factor.name));
        }
    }
    Ok(())
}

/// The built-in eight-factor table.
///
/// Percent-style factors expect values in percent; `debt_level` expects a
/// debt-to-equity ratio.
pub fn default_factors() -> Vec<FactorDefinition> {
    use Polarity::{Negative, Positive};

    vec![
        FactorDefinition::new("earnings_growth", DataType::Earnings, 3, Positive, [25.0, 10.0, 5.0, 0.0, -5.0, -15.0]),
        FactorDefinition::new("earnings_surprise", DataType::Earnings, 1, Positive, [10.0, 5.0, 2.0, -2.0, -5.0, -10.0]),
        FactorDefinition::new("revenue_growth", DataType::Revenue, 2, Positive, [20.0, 10.0, 5.0, 0.0, -5.0, -10.0]),
        FactorDefinition::new("debt_level", DataType::DebtRatio, 2, Negative, [0.3, 0.5, 0.8, 1.0, 1.5, 2.5]),
        FactorDefinition::new("profit_margin", DataType::ProfitMargin, 2, Positive, [25.0, 15.0, 10.0, 5.0, 0.0, -5.0]),
        FactorDefinition::new("return_on_equity", DataType::Roe, 2, Positive, [25.0, 15.0, 10.0, 5.0, 0.0, -5.0]),
        FactorDefinition::new("economic_outlook", DataType::EconomicIndicator, 1, Positive, [3.0, 2.0, 1.0, 0.0, -1.0, -2.0]),
        FactorDefinition::new("forward_guidance", DataType::Guidance, 3, Positive, [15.0, 8.0, 3.0, -3.0, -8.0, -15.0]),
    ]
}
