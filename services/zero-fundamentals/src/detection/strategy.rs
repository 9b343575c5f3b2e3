//! Novelty strategies.
//!
//! Each strategy compares a fetched batch against the previous cursor and
//! returns the new records together with the cursor fields it owns. Fields a
//! strategy does not own are carried over unchanged.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::data::{parse_record_timestamp, record_id, RawRecord};
use crate::types::ChangeDetectionCursor;

/// Outcome of one strategy evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub new_records: Vec<RawRecord>,
    pub last_data_timestamp: Option<DateTime<Utc>>,
    pub known_ids: BTreeSet<String>,
    pub content_hash: Option<String>,
}

impl Detection {
    fn carry_over(previous: Option<&ChangeDetectionCursor>) -> Self {
        match previous {
            Some(cursor) => Self {
                new_records: Vec::new(),
                last_data_timestamp: cursor.last_data_timestamp,
                known_ids: cursor.known_ids.clone(),
                content_hash: cursor.content_hash.clone(),
            },
            None => Self::default(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.new_records.is_empty()
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Serialize with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), canonicalize(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Hex SHA-256 of a JSON value's canonical form.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn record_hash(record: &RawRecord) -> String {
    content_hash(&Value::Object(record.clone()))
}

fn batch_hash(records: &[RawRecord]) -> String {
    content_hash(&Value::Array(
        records.iter().cloned().map(Value::Object).collect(),
    ))
}

// ============================================================================
// Strategies
// ============================================================================

/// Records strictly newer than the cursor's last data timestamp.
///
/// Records whose timestamp cannot be parsed are never new. Ties are not new.
pub fn detect_by_timestamp(
    previous: Option<&ChangeDetectionCursor>,
    records: &[RawRecord],
    field: &str,
) -> Detection {
    let mut detection = Detection::carry_over(previous);
    let watermark = detection.last_data_timestamp;

    for record in records {
        let Some(ts) = parse_record_timestamp(record, field) else {
            continue;
        };
        if watermark.map_or(true, |w| ts > w) {
            detection.new_records.push(record.clone());
        }
        if detection.last_data_timestamp.map_or(true, |latest| ts > latest) {
            detection.last_data_timestamp = Some(ts);
        }
    }

    detection
}

/// Records whose id is not yet known.
///
/// Duplicate ids within one batch count once. Records without an id are
/// skipped.
pub fn detect_by_identifier(
    previous: Option<&ChangeDetectionCursor>,
    records: &[RawRecord],
    field: &str,
) -> Detection {
    let mut detection = Detection::carry_over(previous);

    for record in records {
        let Some(id) = record_id(record, field) else {
            continue;
        };
        if detection.known_ids.insert(id) {
            detection.new_records.push(record.clone());
        }
    }

    detection
}

/// Whole-batch comparison; any difference makes every record new.
///
/// An empty batch never reports changes and leaves the stored hash alone.
pub fn detect_by_content_hash(
    previous: Option<&ChangeDetectionCursor>,
    records: &[RawRecord],
) -> Detection {
    let mut detection = Detection::carry_over(previous);
    if records.is_empty() {
        return detection;
    }

    let hash = batch_hash(records);
    if detection.content_hash.as_deref() != Some(hash.as_str()) {
        detection.new_records = records.to_vec();
        detection.content_hash = Some(hash);
    }

    detection
}
