//! Zero Fundamentals Library
//!
//! Collects fundamental (non-price) data for a fixed set of assets, detects
//! when it has actually changed, and turns the latest fundamentals into a
//! directional bias with a confidence value.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       zero-fundamentals                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐     │
//! │  │  Update         │─►│  Change         │─►│  Storage        │     │
//! │  │  Scheduler      │  │  Detection      │  │  (snapshots)    │     │
//! │  └─────────────────┘  └─────────────────┘  └────────┬────────┘     │
//! │           │ results                                 ▼              │
//! │  ┌────────▼────────┐                       ┌─────────────────┐     │
//! │  │  BiasService    │──────────────────────►│  Bias Scoring   │     │
//! │  └─────────────────┘                       └─────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Change Detection
//! - **Timestamp**: records strictly newer than the cursor's watermark
//! - **Identifier**: records whose id has not been seen
//! - **Content hash**: any difference in the canonical payload
//!
//! ## Bias
//! - Eight weighted factors score the latest snapshot of their data type
//! - The weighted composite maps to `STRONG_BULLISH` .. `STRONG_BEARISH`
//! - Confidence combines data volume with cross-factor agreement

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod data;
pub mod detection;
pub mod scheduler;
pub mod scoring;
pub mod service;
pub mod settings;
pub mod storage;
pub mod types;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use zero_common::config::Config;

pub use data::{AssetClass, AssetConfig, DataSource, DataType, JsonFileSource, SourceConfig};
pub use detection::{ChangeDetectionEngine, ChangeDetectionResult, DetectionMethod};
pub use scheduler::{EventType, ScheduledEvent, UpdateScheduler};
pub use scoring::{BiasScoringEngine, ScoringResult};
pub use service::{AssetOverview, BiasService, ServiceStatus};
pub use settings::FundamentalsSettings;
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
pub use types::{Bias, BiasScore, ChangeDetectionCursor, FundamentalSnapshot};

/// Build a service from configuration, reading records from the data directory.
pub fn build_service(config: &Config) -> Result<BiasService> {
    let settings = FundamentalsSettings::try_from(&config.fundamentals)
        .context("Invalid fundamentals configuration")?;
    scoring::validate_factors(&scoring::default_factors())
        .map_err(|e| anyhow!("Invalid factor table: {e}"))?;
    let storage = storage::open_storage(&config.fundamentals.storage)
        .context("Failed to open fundamentals storage")?;
    let source = Arc::new(JsonFileSource::new(settings.data_dir.clone()));

    tracing::info!(
        data_dir = %settings.data_dir.display(),
        assets = settings.assets.len(),
        "Fundamentals service configured"
    );

    Ok(BiasService::new(settings, storage, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.fundamentals.storage.backend = "memory".into();
        config.fundamentals.data_dir = Some(dir.path().to_string_lossy().into_owned());
        config
    }

    #[tokio::test]
    async fn test_build_service_registers_default_assets() {
        let dir = TempDir::new().unwrap();
        let service = build_service(&memory_config(&dir)).unwrap();

        let status = service.get_service_status().await.unwrap();
        assert_eq!(status.assets_tracked, 5);
        assert_eq!(status.scheduler.total_jobs, 17);
        assert!(!status.is_running);
    }

    #[test]
    fn test_build_service_rejects_unknown_backend() {
        let dir = TempDir::new().unwrap();
        let mut config = memory_config(&dir);
        config.fundamentals.storage.backend = "postgres".into();
        assert!(build_service(&config).is_err());
    }
}
