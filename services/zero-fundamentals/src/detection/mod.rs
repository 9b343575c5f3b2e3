//! Change detection for fundamental sources.
//!
//! One pass per `(asset, data_type)`:
//! 1. fetch raw records (bounded by the fetch timeout)
//! 2. pick exactly one strategy from the source's capabilities
//!    (timestamp > identifier > content hash)
//! 3. turn new records into snapshots and persist them
//! 4. overwrite the cursor
//!
//! Source failures are reported in the result, never returned as errors.
//! Storage failures propagate to the caller.

mod strategy;

pub use strategy::{
    canonical_json, content_hash, detect_by_content_hash, detect_by_identifier,
    detect_by_timestamp, record_hash, Detection,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::data::{
    extract_value, parse_record_timestamp, DataSource, DataType, RawRecord, SourceConfig,
    SourceError, SourceKey,
};
use crate::storage::{Storage, StorageResult};
use crate::types::{ChangeDetectionCursor, FundamentalSnapshot};

// ============================================================================
// Results
// ============================================================================

/// Strategy used for a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Timestamp,
    Identifier,
    ContentHash,
}

impl DetectionMethod {
    /// Strategy chosen by source capability.
    pub fn for_source(source: &SourceConfig) -> Self {
        if source.timestamp_field.is_some() {
            Self::Timestamp
        } else if source.id_field.is_some() {
            Self::Identifier
        } else {
            Self::ContentHash
        }
    }
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeDetectionResult {
    pub asset: String,
    pub data_type: DataType,
    pub has_changes: bool,
    /// Records judged new by the strategy
    pub new_records: usize,
    /// Snapshots actually inserted
    pub snapshots_written: usize,
    pub method: DetectionMethod,
    pub duration: Duration,
    pub checked_at: DateTime<Utc>,
    /// Set when the fetch failed
    pub error: Option<String>,
}

impl ChangeDetectionResult {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.asset.clone(), self.data_type)
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Detects new fundamental data and advances cursors.
pub struct ChangeDetectionEngine {
    storage: Arc<dyn Storage>,
    data_source: Arc<dyn DataSource>,
    fetch_timeout: Duration,
    /// Serializes passes for the same key
    key_locks: Mutex<HashMap<SourceKey, Arc<Mutex<()>>>>,
}

impl ChangeDetectionEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        data_source: Arc<dyn DataSource>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            data_source,
            fetch_timeout,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// True when the source has no cursor or its next check is due.
    pub async fn needs_check(&self, source: &SourceConfig, now: DateTime<Utc>) -> StorageResult<bool> {
        let cursor = self.storage.get_cursor(&source.asset, source.data_type).await?;
        Ok(cursor.map_or(true, |c| c.next_scheduled_check <= now))
    }

    /// Fetch the source and run a detection pass over the batch.
    pub async fn check_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
    ) -> StorageResult<ChangeDetectionResult> {
        let started = Instant::now();

        let fetched = match tokio::time::timeout(self.fetch_timeout, self.data_source.fetch(source)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.fetch_timeout.as_secs())),
        };

        match fetched {
            Ok(records) => self.detect_changes(source, &records, now).await,
            Err(e) => {
                warn!(
                    asset = %source.asset,
                    data_type = %source.data_type,
                    source = %self.data_source.name(),
                    error = %e,
                    "Source fetch failed, reporting no changes"
                );
                Ok(ChangeDetectionResult {
                    asset: source.asset.clone(),
                    data_type: source.data_type,
                    has_changes: false,
                    new_records: 0,
                    snapshots_written: 0,
                    method: DetectionMethod::for_source(source),
                    duration: started.elapsed(),
                    checked_at: now,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Run a detection pass over an already-fetched batch.
    pub async fn detect_changes(
        &self,
        source: &SourceConfig,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> StorageResult<ChangeDetectionResult> {
        let started = Instant::now();
        let key = source.key();
        let key_lock = self.key_lock(&key).await;
        let _guard = key_lock.lock().await;

        let previous = self.storage.get_cursor(&source.asset, source.data_type).await?;
        let method = DetectionMethod::for_source(source);

        let detection = match (method, &source.timestamp_field, &source.id_field) {
            (DetectionMethod::Timestamp, Some(field), _) => {
                detect_by_timestamp(previous.as_ref(), records, field)
            }
            (DetectionMethod::Identifier, _, Some(field)) => {
                detect_by_identifier(previous.as_ref(), records, field)
            }
            _ => detect_by_content_hash(previous.as_ref(), records),
        };

        let has_changes = detection.has_changes();
        let snapshots_written = if has_changes {
            self.write_snapshots(source, &detection.new_records, now).await?
        } else {
            0
        };

        let cursor = ChangeDetectionCursor {
            asset: source.asset.clone(),
            data_type: source.data_type,
            last_check_timestamp: now,
            last_data_timestamp: detection.last_data_timestamp,
            known_ids: detection.known_ids,
            content_hash: detection.content_hash,
            check_frequency: source.check_frequency,
            next_scheduled_check: now + source.check_frequency,
        };
        self.storage.put_cursor(&cursor).await?;

        if has_changes {
            info!(
                asset = %source.asset,
                data_type = %source.data_type,
                method = ?method,
                new_records = detection.new_records.len(),
                snapshots_written,
                "Fundamental data changed"
            );
        } else {
            debug!(
                asset = %source.asset,
                data_type = %source.data_type,
                method = ?method,
                "No new fundamental data"
            );
        }

        Ok(ChangeDetectionResult {
            asset: source.asset.clone(),
            data_type: source.data_type,
            has_changes,
            new_records: detection.new_records.len(),
            snapshots_written,
            method,
            duration: started.elapsed(),
            checked_at: now,
            error: None,
        })
    }

    async fn key_lock(&self, key: &SourceKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Persist new records as snapshots, oldest first.
    ///
    /// `previous_value` chains from the latest stored snapshot through the
    /// batch. Records without an extractable value are skipped.
    async fn write_snapshots(
        &self,
        source: &SourceConfig,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut previous_value = self
            .storage
            .get_latest_snapshots(&source.asset, Some(source.data_type), 1)
            .await?
            .first()
            .map(|s| s.value);

        let mut timed: Vec<(DateTime<Utc>, &RawRecord)> = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let ts = source
                    .timestamp_field
                    .as_deref()
                    .and_then(|field| parse_record_timestamp(record, field))
                    .unwrap_or_else(|| now + chrono::Duration::milliseconds(i as i64));
                (ts, record)
            })
            .collect();
        timed.sort_by_key(|(ts, _)| *ts);

        let mut written = 0;
        for (timestamp, record) in timed {
            let Some(value) = extract_value(source.data_type, record, source.value_field.as_deref())
            else {
                warn!(
                    asset = %source.asset,
                    data_type = %source.data_type,
                    "Record has no extractable value, skipping"
                );
                continue;
            };

            let snapshot = FundamentalSnapshot {
                asset: source.asset.clone(),
                data_type: source.data_type,
                value,
                previous_value,
                timestamp,
                source: source.name.clone(),
                content_hash: record_hash(record),
                change_detected: previous_value.is_some_and(|p| p != value),
            };

            if self.storage.put_snapshot(&snapshot).await? {
                written += 1;
            }
            previous_value = Some(value);
        }

        Ok(written)
    }
}
