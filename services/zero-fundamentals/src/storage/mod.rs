//! Storage for snapshots, detection cursors and bias scores.
//!
//! # Backends
//! - **MemoryStorage**: per-key maps behind a lock, for tests and ephemeral runs
//! - **SqliteStorage**: durable single-file database (WAL mode)
//!
//! Snapshots and bias scores are append-only. Cursors are replaced whole.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use zero_common::config::FundamentalsStorageConfig;

use crate::data::DataType;
use crate::types::{BiasScore, ChangeDetectionCursor, FundamentalSnapshot};

// ============================================================================
// Storage Error
// ============================================================================

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Storage Trait
// ============================================================================

/// Durable keyed store used by every engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name (for logging)
    fn name(&self) -> &str;

    async fn get_cursor(
        &self,
        asset: &str,
        data_type: DataType,
    ) -> StorageResult<Option<ChangeDetectionCursor>>;

    /// Replace the cursor for its `(asset, data_type)` key.
    async fn put_cursor(&self, cursor: &ChangeDetectionCursor) -> StorageResult<()>;

    /// Insert a snapshot. Returns `false` when the key already existed.
    async fn put_snapshot(&self, snapshot: &FundamentalSnapshot) -> StorageResult<bool>;

    /// Most recent snapshots first, at most `limit`.
    async fn get_latest_snapshots(
        &self,
        asset: &str,
        data_type: Option<DataType>,
        limit: usize,
    ) -> StorageResult<Vec<FundamentalSnapshot>>;

    /// Append a bias score. An existing `(asset, timestamp)` row is kept.
    async fn put_bias_score(&self, score: &BiasScore) -> StorageResult<()>;

    async fn get_latest_bias_score(&self, asset: &str) -> StorageResult<Option<BiasScore>>;

    /// Latest score of every asset that has one, ordered by asset.
    async fn get_all_latest_bias_scores(&self) -> StorageResult<Vec<BiasScore>>;

    /// Score history, newest first.
    async fn get_bias_history(&self, asset: &str, limit: usize) -> StorageResult<Vec<BiasScore>>;
}

/// Open the backend named in the configuration.
pub fn open_storage(config: &FundamentalsStorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.backend.as_str() {
        "memory" => {
            info!(backend = "memory", "Opening fundamentals storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
        "sqlite" => {
            let path = config.resolved_db_path();
            info!(backend = "sqlite", path = %path.display(), "Opening fundamentals storage");
            Ok(Arc::new(SqliteStorage::open(&path)?))
        }
        other => Err(StorageError::Unavailable(format!(
            "unknown storage backend: {other}"
        ))),
    }
}
