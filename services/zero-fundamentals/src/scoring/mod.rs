//! Bias scoring.
//!
//! Turns the latest fundamental snapshots of an asset into a five-level bias
//! with a confidence value:
//!
//! ```text
//! snapshots ─► factor scores ─► weighted composite ─► bias
//!                    └───────────► agreement ─────────► confidence
//! ```
//!
//! Every successful calculation appends a `BiasScore` row.

mod factors;

pub use factors::{default_factors, validate_factors, FactorDefinition, Polarity, Thresholds};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::data::DataType;
use crate::storage::{Storage, StorageResult};
use crate::types::{Bias, BiasScore, FactorScore, FundamentalSnapshot};

/// Explanation attached to the no-data result.
pub const NO_DATA_EXPLANATION: &str = "No fundamental data available";

/// Confidence reported when an asset has no data at all.
pub const NO_DATA_CONFIDENCE: f64 = 0.1;

/// Snapshot count at which data quality saturates.
const FULL_QUALITY_SNAPSHOTS: f64 = 10.0;

/// Outcome of one scoring pass.
#[derive(Debug, Clone)]
pub struct ScoringResult {
    pub score: BiasScore,
    pub snapshot_count: usize,
    /// False for the neutral no-data result
    pub has_data: bool,
}

// ============================================================================
// Pure Scoring
// ============================================================================

/// `Σ(score·weight) / Σ(weight)`, or 0 with no weight.
pub fn weighted_score(scores: &[FactorScore]) -> f64 {
    let total_weight: f64 = scores.iter().map(|s| f64::from(s.weight)).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    scores
        .iter()
        .map(|s| s.score * f64::from(s.weight))
        .sum::<f64>()
        / total_weight
}

/// `min(data_quality · consistency, 1)`.
///
/// `data_quality = min(snapshot_count / 10, 1)`; `consistency` is the share of
/// nonzero scores on the majority side, or 1 when every score is zero.
pub fn confidence(snapshot_count: usize, scores: &[f64]) -> f64 {
    let data_quality = (snapshot_count as f64 / FULL_QUALITY_SNAPSHOTS).min(1.0);

    let positive = scores.iter().filter(|s| **s > 0.0).count();
    let negative = scores.iter().filter(|s| **s < 0.0).count();
    let nonzero = positive + negative;
    let consistency = if nonzero == 0 {
        1.0
    } else {
        positive.max(negative) as f64 / nonzero as f64
    };

    (data_quality * consistency).min(1.0)
}

/// Score snapshots against the factor table.
///
/// Each factor reads the newest of `snapshots` with its data type;
/// `snapshot_count` only feeds data quality.
pub fn score_snapshots(
    asset: &str,
    factors: &[FactorDefinition],
    snapshots: &[FundamentalSnapshot],
    snapshot_count: usize,
    now: DateTime<Utc>,
) -> BiasScore {
    let mut latest: HashMap<DataType, &FundamentalSnapshot> = HashMap::new();
    for snapshot in snapshots {
        latest
            .entry(snapshot.data_type)
            .and_modify(|current| {
                if snapshot.timestamp > current.timestamp {
                    *current = snapshot;
                }
            })
            .or_insert(snapshot);
    }

    let mut factor_scores = Vec::with_capacity(factors.len());
    let mut bullish_factors = Vec::new();
    let mut bearish_factors = Vec::new();

    for factor in factors {
        let score = match latest.get(&factor.data_type) {
            Some(snapshot) => {
                let score = factor.score(snapshot);
                let explanation = format!("{}: {:.2} ({:+})", factor.name, snapshot.value, score);
                if score > 0.0 {
                    bullish_factors.push(explanation);
                } else if score < 0.0 {
                    bearish_factors.push(explanation);
                }
                score
            }
            None => 0.0,
        };
        factor_scores.push(FactorScore {
            name: factor.name.clone(),
            data_type: factor.data_type,
            score,
            weight: factor.weight,
        });
    }

    let weighted = weighted_score(&factor_scores);
    let raw: Vec<f64> = factor_scores.iter().map(|f| f.score).collect();

    BiasScore {
        asset: asset.to_string(),
        timestamp: now,
        total_score: raw.iter().sum(),
        weighted_score: weighted,
        bias: Bias::from_weighted_score(weighted),
        confidence: confidence(snapshot_count, &raw),
        factor_scores,
        bullish_factors,
        bearish_factors,
    }
}

/// Fixed neutral result for an asset without fundamentals.
pub fn no_data_score(asset: &str, factors: &[FactorDefinition], now: DateTime<Utc>) -> BiasScore {
    BiasScore {
        asset: asset.to_string(),
        timestamp: now,
        factor_scores: factors
            .iter()
            .map(|f| FactorScore {
                name: f.name.clone(),
                data_type: f.data_type,
                score: 0.0,
                weight: f.weight,
            })
            .collect(),
        total_score: 0.0,
        weighted_score: 0.0,
        bias: Bias::Neutral,
        confidence: NO_DATA_CONFIDENCE,
        bullish_factors: Vec::new(),
        bearish_factors: vec![NO_DATA_EXPLANATION.to_string()],
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Reads snapshots, scores them and appends the result.
pub struct BiasScoringEngine {
    storage: Arc<dyn Storage>,
    factors: Vec<FactorDefinition>,
    snapshot_limit: usize,
}

impl BiasScoringEngine {
    pub fn new(storage: Arc<dyn Storage>, factors: Vec<FactorDefinition>, snapshot_limit: usize) -> Self {
        Self {
            storage,
            factors,
            snapshot_limit: snapshot_limit.max(1),
        }
    }

    pub fn factors(&self) -> &[FactorDefinition] {
        &self.factors
    }

    /// Score an asset from its latest snapshots.
    ///
    /// Every factor data type is read on its own, so a busy data type cannot
    /// push another's newest snapshot out of the window. The no-data result
    /// is returned without being stored.
    pub async fn calculate_bias_score(
        &self,
        asset: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ScoringResult> {
        let recent = self
            .storage
            .get_latest_snapshots(asset, None, self.snapshot_limit)
            .await?;

        if recent.is_empty() {
            debug!(asset = %asset, "No fundamental data, returning neutral bias");
            return Ok(ScoringResult {
                score: no_data_score(asset, &self.factors, now),
                snapshot_count: 0,
                has_data: false,
            });
        }

        let mut seen = HashSet::new();
        let mut latest = Vec::new();
        for factor in &self.factors {
            if seen.insert(factor.data_type) {
                latest.extend(
                    self.storage
                        .get_latest_snapshots(asset, Some(factor.data_type), 1)
                        .await?,
                );
            }
        }

        let score = score_snapshots(asset, &self.factors, &latest, recent.len(), now);
        self.storage.put_bias_score(&score).await?;

        info!(
            asset = %asset,
            bias = %score.bias,
            weighted_score = score.weighted_score,
            confidence = score.confidence,
            snapshots = recent.len(),
            "Bias score calculated"
        );

        Ok(ScoringResult {
            score,
            snapshot_count: recent.len(),
            has_data: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use test_case::test_case;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn snapshot(data_type: DataType, value: f64, minutes: i64) -> FundamentalSnapshot {
        FundamentalSnapshot {
            asset: "AAPL".into(),
            data_type,
            value,
            previous_value: None,
            timestamp: ts(minutes),
            source: "test".into(),
            content_hash: String::new(),
            change_detected: false,
        }
    }

    fn scores_with_weights(values: &[(f64, u8)]) -> Vec<FactorScore> {
        values
            .iter()
            .enumerate()
            .map(|(i, (score, weight))| FactorScore {
                name: format!("f{i}"),
                data_type: DataType::Earnings,
                score: *score,
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_weighted_score() {
        let scores = scores_with_weights(&[(2.0, 3), (-1.0, 1), (0.0, 2)]);
        assert!((weighted_score(&scores) - 5.0 / 6.0).abs() < 1e-12);
        assert_eq!(weighted_score(&[]), 0.0);
    }

    #[test_case(10, &[1.0; 10], 1.0 ; "ten agreeing snapshots")]
    #[test_case(5, &[1.0, 2.0, 1.0, -1.0, -2.0], 0.3 ; "five snapshots three agreeing")]
    #[test_case(20, &[0.0, 0.0], 1.0 ; "all zero is consistent")]
    #[test_case(3, &[-1.0, -1.0], 0.3 ; "few snapshots")]
    fn test_confidence(count: usize, scores: &[f64], expected: f64) {
        assert!((confidence(count, scores) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_score_snapshots_uses_latest_per_type() {
        let factors = default_factors();
        let snapshots = vec![
            snapshot(DataType::DebtRatio, 3.0, 10),
            snapshot(DataType::DebtRatio, 0.2, 5),
            snapshot(DataType::Guidance, 20.0, 1),
        ];
        let score = score_snapshots("AAPL", &factors, &snapshots, snapshots.len(), ts(20));

        assert_eq!(score.factor("debt_level").unwrap().score, -2.0);
        assert_eq!(score.factor("forward_guidance").unwrap().score, 2.0);
        assert_eq!(score.factor("earnings_growth").unwrap().score, 0.0);
        // (-2*2 + 2*3) / 16
        assert!((score.weighted_score - 2.0 / 16.0).abs() < 1e-12);
        assert_eq!(score.bias, Bias::Neutral);
        assert_eq!(score.total_score, 0.0);
        assert_eq!(score.bullish_factors.len(), 1);
        assert_eq!(score.bearish_factors.len(), 1);
        assert!(score.bearish_factors[0].starts_with("debt_level"));
        // 3 snapshots, 1 of 2 nonzero agree
        assert!((score.confidence - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_data_result_is_neutral_and_not_stored() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = BiasScoringEngine::new(storage.clone(), default_factors(), 50);

        let result = engine.calculate_bias_score("ZZZ", ts(0)).await.unwrap();
        assert!(!result.has_data);
        assert_eq!(result.score.bias, Bias::Neutral);
        assert_eq!(result.score.confidence, NO_DATA_CONFIDENCE);
        assert_eq!(result.score.bearish_factors, vec![NO_DATA_EXPLANATION.to_string()]);
        assert!(storage.get_latest_bias_score("ZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calculation_appends_history() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_snapshot(&snapshot(DataType::Guidance, 20.0, 0))
            .await
            .unwrap();
        let engine = BiasScoringEngine::new(storage.clone(), default_factors(), 50);

        engine.calculate_bias_score("AAPL", ts(1)).await.unwrap();
        let second = engine.calculate_bias_score("AAPL", ts(2)).await.unwrap();
        assert!(second.has_data);
        assert_eq!(second.snapshot_count, 1);

        let history = storage.get_bias_history("AAPL", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, ts(2));
    }

    #[tokio::test]
    async fn test_factor_reads_newest_of_its_type_past_the_window() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_snapshot(&snapshot(DataType::Guidance, 20.0, 0))
            .await
            .unwrap();
        for minute in 1..=50 {
            storage
                .put_snapshot(&snapshot(DataType::EconomicIndicator, 0.0, minute))
                .await
                .unwrap();
        }
        let engine = BiasScoringEngine::new(storage.clone(), default_factors(), 50);

        let result = engine.calculate_bias_score("AAPL", ts(60)).await.unwrap();
        assert!(result.has_data);
        assert_eq!(result.snapshot_count, 50);
        assert_eq!(result.score.factor("forward_guidance").unwrap().score, 2.0);
        assert!(result.score.weighted_score > 0.0);
    }

    proptest! {
        #[test]
        fn prop_raising_a_factor_never_turns_more_bearish(
            values in proptest::collection::vec((-2i8..=2, 1u8..=3), 1..8),
            index in 0usize..8,
        ) {
            let index = index % values.len();
            prop_assume!(values[index].0 < 2);

            let before = scores_with_weights(
                &values.iter().map(|(s, w)| (f64::from(*s), *w)).collect::<Vec<_>>(),
            );
            let mut after = before.clone();
            after[index].score += 1.0;

            let w_before = weighted_score(&before);
            let w_after = weighted_score(&after);
            prop_assert!(w_after >= w_before);
            prop_assert!(
                Bias::from_weighted_score(w_after).rank() >= Bias::from_weighted_score(w_before).rank()
            );
        }
    }
}
