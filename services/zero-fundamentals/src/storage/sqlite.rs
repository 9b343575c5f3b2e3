//! SQLite storage backend.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that lexicographic order matches time order.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Storage, StorageError, StorageResult};
use crate::data::DataType;
use crate::types::{Bias, BiasScore, ChangeDetectionCursor, FactorScore, FundamentalSnapshot};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Append-only fundamental observations
CREATE TABLE IF NOT EXISTS fundamental_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset TEXT NOT NULL,
    data_type TEXT NOT NULL,
    value REAL NOT NULL,
    previous_value REAL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    change_detected INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(asset, data_type, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_asset_ts
ON fundamental_snapshots(asset, timestamp DESC);

-- One live cursor per (asset, data_type)
CREATE TABLE IF NOT EXISTS detection_cursors (
    asset TEXT NOT NULL,
    data_type TEXT NOT NULL,
    last_check_timestamp TEXT NOT NULL,
    last_data_timestamp TEXT,
    known_ids TEXT NOT NULL DEFAULT '[]',
    content_hash TEXT,
    check_frequency_secs INTEGER NOT NULL,
    next_scheduled_check TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (asset, data_type)
);

-- Append-only bias history
CREATE TABLE IF NOT EXISTS bias_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    total_score REAL NOT NULL,
    weighted_score REAL NOT NULL,
    bias TEXT NOT NULL,
    confidence REAL NOT NULL,
    factor_scores TEXT NOT NULL,
    bullish_factors TEXT NOT NULL,
    bearish_factors TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(asset, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_bias_scores_asset_ts
ON bias_scores(asset, timestamp DESC);
"#;

const SNAPSHOT_COLUMNS: &str =
    "asset, data_type, value, previous_value, timestamp, source, content_hash, change_detected";

const BIAS_COLUMNS: &str = "asset, timestamp, total_score, weighted_score, bias, confidence, \
     factor_scores, bullish_factors, bearish_factors";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_data_type(raw: &str) -> StorageResult<DataType> {
    raw.parse().map_err(StorageError::Corrupt)
}

// ============================================================================
// Row Types
// ============================================================================

struct SnapshotRow {
    asset: String,
    data_type: String,
    value: f64,
    previous_value: Option<f64>,
    timestamp: String,
    source: String,
    content_hash: String,
    change_detected: bool,
}

impl SnapshotRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            asset: row.get(0)?,
            data_type: row.get(1)?,
            value: row.get(2)?,
            previous_value: row.get(3)?,
            timestamp: row.get(4)?,
            source: row.get(5)?,
            content_hash: row.get(6)?,
            change_detected: row.get(7)?,
        })
    }

    fn decode(self) -> StorageResult<FundamentalSnapshot> {
        Ok(FundamentalSnapshot {
            asset: self.asset,
            data_type: parse_data_type(&self.data_type)?,
            value: self.value,
            previous_value: self.previous_value,
            timestamp: parse_ts(&self.timestamp)?,
            source: self.source,
            content_hash: self.content_hash,
            change_detected: self.change_detected,
        })
    }
}

struct BiasRow {
    asset: String,
    timestamp: String,
    total_score: f64,
    weighted_score: f64,
    bias: String,
    confidence: f64,
    factor_scores: String,
    bullish_factors: String,
    bearish_factors: String,
}

impl BiasRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            asset: row.get(0)?,
            timestamp: row.get(1)?,
            total_score: row.get(2)?,
            weighted_score: row.get(3)?,
            bias: row.get(4)?,
            confidence: row.get(5)?,
            factor_scores: row.get(6)?,
            bullish_factors: row.get(7)?,
            bearish_factors: row.get(8)?,
        })
    }

    fn decode(self) -> StorageResult<BiasScore> {
        let factor_scores: Vec<FactorScore> = serde_json::from_str(&self.factor_scores)?;
        Ok(BiasScore {
            asset: self.asset,
            timestamp: parse_ts(&self.timestamp)?,
            factor_scores,
            total_score: self.total_score,
            weighted_score: self.weighted_score,
            bias: self.bias.parse::<Bias>().map_err(StorageError::Corrupt)?,
            confidence: self.confidence,
            bullish_factors: serde_json::from_str(&self.bullish_factors)?,
            bearish_factors: serde_json::from_str(&self.bearish_factors)?,
        })
    }
}

// ============================================================================
// SqliteStorage
// ============================================================================

/// SQLite-backed storage.
pub struct SqliteStorage {
    /// rusqlite::Connection is Send but not Sync, hence the Mutex
    db: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(CREATE_TABLES_SQL)?;

        info!(db_path = %path.display(), "Initialized fundamentals database");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_cursor(
        &self,
        asset: &str,
        data_type: DataType,
    ) -> StorageResult<Option<ChangeDetectionCursor>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                r#"
                SELECT last_check_timestamp, last_data_timestamp, known_ids,
                       content_hash, check_frequency_secs, next_scheduled_check
                FROM detection_cursors
                WHERE asset = ?1 AND data_type = ?2
                "#,
                params![asset, data_type.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((last_check, last_data, known_ids, content_hash, freq_secs, next_check)) = row
        else {
            return Ok(None);
        };

        let known_ids: BTreeSet<String> = serde_json::from_str(&known_ids)?;
        Ok(Some(ChangeDetectionCursor {
            asset: asset.to_string(),
            data_type,
            last_check_timestamp: parse_ts(&last_check)?,
            last_data_timestamp: last_data.as_deref().map(parse_ts).transpose()?,
            known_ids,
            content_hash,
            check_frequency: Duration::seconds(freq_secs),
            next_scheduled_check: parse_ts(&next_check)?,
        }))
    }

    async fn put_cursor(&self, cursor: &ChangeDetectionCursor) -> StorageResult<()> {
        let known_ids = serde_json::to_string(&cursor.known_ids)?;
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO detection_cursors
            (asset, data_type, last_check_timestamp, last_data_timestamp, known_ids,
             content_hash, check_frequency_secs, next_scheduled_check)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                cursor.asset,
                cursor.data_type.as_str(),
                format_ts(&cursor.last_check_timestamp),
                cursor.last_data_timestamp.as_ref().map(format_ts),
                known_ids,
                cursor.content_hash,
                cursor.check_frequency.num_seconds(),
                format_ts(&cursor.next_scheduled_check),
            ],
        )?;
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: &FundamentalSnapshot) -> StorageResult<bool> {
        let db = self.db.lock().await;
        let inserted = db.execute(
            r#"
            INSERT OR IGNORE INTO fundamental_snapshots
            (asset, data_type, value, previous_value, timestamp, source, content_hash, change_detected)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                snapshot.asset,
                snapshot.data_type.as_str(),
                snapshot.value,
                snapshot.previous_value,
                format_ts(&snapshot.timestamp),
                snapshot.source,
                snapshot.content_hash,
                snapshot.change_detected,
            ],
        )?;

        if inserted == 0 {
            debug!(
                asset = %snapshot.asset,
                data_type = %snapshot.data_type,
                "Snapshot already stored, ignoring"
            );
        }
        Ok(inserted > 0)
    }

    async fn get_latest_snapshots(
        &self,
        asset: &str,
        data_type: Option<DataType>,
        limit: usize,
    ) -> StorageResult<Vec<FundamentalSnapshot>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let db = self.db.lock().await;

        let rows: Vec<SnapshotRow> = match data_type {
            Some(dt) => {
                let sql = format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM fundamental_snapshots \
                     WHERE asset = ?1 AND data_type = ?2 ORDER BY timestamp DESC LIMIT ?3"
                );
                let mut stmt = db.prepare(&sql)?;
                let mapped = stmt.query_map(params![asset, dt.as_str(), limit], SnapshotRow::from_row)?;
                mapped.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM fundamental_snapshots \
                     WHERE asset = ?1 ORDER BY timestamp DESC LIMIT ?2"
                );
                let mut stmt = db.prepare(&sql)?;
                let mapped = stmt.query_map(params![asset, limit], SnapshotRow::from_row)?;
                mapped.collect::<rusqlite::Result<_>>()?
            }
        };

        rows.into_iter().map(SnapshotRow::decode).collect()
    }

    async fn put_bias_score(&self, score: &BiasScore) -> StorageResult<()> {
        let factor_scores = serde_json::to_string(&score.factor_scores)?;
        let bullish = serde_json::to_string(&score.bullish_factors)?;
        let bearish = serde_json::to_string(&score.bearish_factors)?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR IGNORE INTO bias_scores
            (asset, timestamp, total_score, weighted_score, bias, confidence,
             factor_scores, bullish_factors, bearish_factors)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                score.asset,
                format_ts(&score.timestamp),
                score.total_score,
                score.weighted_score,
                score.bias.as_str(),
                score.confidence,
                factor_scores,
                bullish,
                bearish,
            ],
        )?;
        Ok(())
    }

    async fn get_latest_bias_score(&self, asset: &str) -> StorageResult<Option<BiasScore>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {BIAS_COLUMNS} FROM bias_scores WHERE asset = ?1 \
             ORDER BY timestamp DESC LIMIT 1"
        );
        let row = db
            .query_row(&sql, params![asset], BiasRow::from_row)
            .optional()?;
        row.map(BiasRow::decode).transpose()
    }

    async fn get_all_latest_bias_scores(&self) -> StorageResult<Vec<BiasScore>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {BIAS_COLUMNS} FROM bias_scores b \
             WHERE timestamp = (SELECT MAX(timestamp) FROM bias_scores WHERE asset = b.asset) \
             ORDER BY asset"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<BiasRow> = stmt
            .query_map([], BiasRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(BiasRow::decode).collect()
    }

    async fn get_bias_history(&self, asset: &str, limit: usize) -> StorageResult<Vec<BiasScore>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {BIAS_COLUMNS} FROM bias_scores WHERE asset = ?1 \
             ORDER BY timestamp DESC LIMIT ?2"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows: Vec<BiasRow> = stmt
            .query_map(params![asset, limit], BiasRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(BiasRow::decode).collect()
    }
}
