//! In-memory storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{Storage, StorageResult};
use crate::data::{DataType, SourceKey};
use crate::types::{BiasScore, ChangeDetectionCursor, FundamentalSnapshot};

type SnapshotSeries = BTreeMap<DateTime<Utc>, FundamentalSnapshot>;

/// Storage kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    cursors: RwLock<HashMap<SourceKey, ChangeDetectionCursor>>,
    snapshots: RwLock<HashMap<SourceKey, SnapshotSeries>>,
    scores: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, BiasScore>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored snapshots (all assets).
    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.values().map(|s| s.len()).sum()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_cursor(
        &self,
        asset: &str,
        data_type: DataType,
    ) -> StorageResult<Option<ChangeDetectionCursor>> {
        let key = SourceKey::new(asset, data_type);
        Ok(self.cursors.read().await.get(&key).cloned())
    }

    async fn put_cursor(&self, cursor: &ChangeDetectionCursor) -> StorageResult<()> {
        self.cursors
            .write()
            .await
            .insert(cursor.key(), cursor.clone());
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: &FundamentalSnapshot) -> StorageResult<bool> {
        let mut snapshots = self.snapshots.write().await;
        let series = snapshots.entry(snapshot.key()).or_default();
        if series.contains_key(&snapshot.timestamp) {
            return Ok(false);
        }
        series.insert(snapshot.timestamp, snapshot.clone());
        Ok(true)
    }

    async fn get_latest_snapshots(
        &self,
        asset: &str,
        data_type: Option<DataType>,
        limit: usize,
    ) -> StorageResult<Vec<FundamentalSnapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut matching: Vec<FundamentalSnapshot> = snapshots
            .iter()
            .filter(|(key, _)| {
                key.asset == asset && data_type.map_or(true, |dt| dt == key.data_type)
            })
            .flat_map(|(_, series)| series.values().cloned())
            .collect();

        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn put_bias_score(&self, score: &BiasScore) -> StorageResult<()> {
        self.scores
            .write()
            .await
            .entry(score.asset.clone())
            .or_default()
            .entry(score.timestamp)
            .or_insert_with(|| score.clone());
        Ok(())
    }

    async fn get_latest_bias_score(&self, asset: &str) -> StorageResult<Option<BiasScore>> {
        let scores = self.scores.read().await;
        Ok(scores
            .get(asset)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn get_all_latest_bias_scores(&self) -> StorageResult<Vec<BiasScore>> {
        let scores = self.scores.read().await;
        let mut latest: Vec<BiasScore> = scores
            .values()
            .filter_map(|history| history.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(latest)
    }

    async fn get_bias_history(&self, asset: &str, limit: usize) -> StorageResult<Vec<BiasScore>> {
        let scores = self.scores.read().await;
        Ok(scores
            .get(asset)
            .map(|history| history.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
