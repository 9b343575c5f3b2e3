//! Integration tests for the update scheduler.
//!
//! Drives `tick` with explicit clocks so backoff, event and rate limit
//! behavior can be checked without waiting on the real interval.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;

use zero_fundamentals::data::{DataSource, DataType, RawRecord, SourceConfig, SourceError, SourceKey};
use zero_fundamentals::detection::ChangeDetectionEngine;
use zero_fundamentals::scheduler::{
    EventType, RateLimits, ScheduledEvent, SchedulerConfig, UpdateScheduler,
};
use zero_fundamentals::storage::{MemoryStorage, Storage, StorageError, StorageResult};
use zero_fundamentals::types::{BiasScore, ChangeDetectionCursor, FundamentalSnapshot};

// ============================================================================
// Mock Sources
// ============================================================================

/// Counts calls; fails while `failing` is set
struct CountingSource {
    failing: AtomicBool,
    calls: AtomicU32,
}

impl CountingSource {
    fn new(failing: bool) -> Self {
        Self {
            failing: AtomicBool::new(failing),
            calls: AtomicU32::new(0),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DataSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn fetch(&self, _source: &SourceConfig) -> Result<Vec<RawRecord>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(SourceError::Unavailable("maintenance".into()));
        }
        let record = json!({"value": f64::from(call) + 1.0});
        Ok(record.as_object().cloned().into_iter().collect())
    }
}

/// Blocks every fetch until the gate is opened
struct GatedSource {
    gate: Arc<Semaphore>,
    calls: AtomicU32,
}

#[async_trait]
impl DataSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch(&self, _source: &SourceConfig) -> Result<Vec<RawRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(Vec::new())
    }
}

// ============================================================================
// Mock Storage
// ============================================================================

/// Memory storage whose cursor reads fail for one data type
struct FailingStorage {
    inner: MemoryStorage,
    broken: DataType,
}

impl FailingStorage {
    fn check(&self, data_type: DataType) -> StorageResult<()> {
        if data_type == self.broken {
            return Err(StorageError::Unavailable("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FailingStorage {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get_cursor(
        &self,
        asset: &str,
        data_type: DataType,
    ) -> StorageResult<Option<ChangeDetectionCursor>> {
        self.check(data_type)?;
        self.inner.get_cursor(asset, data_type).await
    }

    async fn put_cursor(&self, cursor: &ChangeDetectionCursor) -> StorageResult<()> {
        self.inner.put_cursor(cursor).await
    }

    async fn put_snapshot(&self, snapshot: &FundamentalSnapshot) -> StorageResult<bool> {
        self.inner.put_snapshot(snapshot).await
    }

    async fn get_latest_snapshots(
        &self,
        asset: &str,
        data_type: Option<DataType>,
        limit: usize,
    ) -> StorageResult<Vec<FundamentalSnapshot>> {
        self.inner.get_latest_snapshots(asset, data_type, limit).await
    }

    async fn put_bias_score(&self, score: &BiasScore) -> StorageResult<()> {
        self.inner.put_bias_score(score).await
    }

    async fn get_latest_bias_score(&self, asset: &str) -> StorageResult<Option<BiasScore>> {
        self.inner.get_latest_bias_score(asset).await
    }

    async fn get_all_latest_bias_scores(&self) -> StorageResult<Vec<BiasScore>> {
        self.inner.get_all_latest_bias_scores().await
    }

    async fn get_bias_history(&self, asset: &str, limit: usize) -> StorageResult<Vec<BiasScore>> {
        self.inner.get_bias_history(asset, limit).await
    }
}

fn scheduler(source: Arc<dyn DataSource>, config: SchedulerConfig) -> Arc<UpdateScheduler> {
    scheduler_with_storage(Arc::new(MemoryStorage::new()), source, config)
}

fn scheduler_with_storage(
    storage: Arc<dyn Storage>,
    source: Arc<dyn DataSource>,
    config: SchedulerConfig,
) -> Arc<UpdateScheduler> {
    let engine = Arc::new(ChangeDetectionEngine::new(storage, source, Duration::from_secs(5)));
    Arc::new(UpdateScheduler::new(config, engine))
}

// ============================================================================
// Backoff
// ============================================================================

#[tokio::test]
async fn test_failures_back_off_then_reset() {
    let source = Arc::new(CountingSource::new(true));
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let config = SourceConfig::new("AAPL", DataType::Earnings);
    let key = config.key();
    let start = Utc::now();
    scheduler.register_source(config, start);

    let mut now = start;
    for expected_minutes in [10, 20, 40] {
        let report = scheduler.tick(now).await;
        assert_eq!(report.jobs_dispatched, 1);
        report.join().await;

        let job = scheduler.job(&key).unwrap();
        assert!(!job.running);
        assert_eq!(job.next_run, now + chrono::Duration::minutes(expected_minutes));

        // nothing is due before the backoff expires
        let early = scheduler.tick(now + chrono::Duration::minutes(1)).await;
        assert_eq!(early.jobs_dispatched, 0);

        now = job.next_run;
    }

    let report = scheduler.tick(now).await;
    report.join().await;
    let job = scheduler.job(&key).unwrap();
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.next_run, now + job.interval);
    assert_eq!(source.call_count(), 4);
}

#[tokio::test]
async fn test_success_schedules_normal_interval() {
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let config = SourceConfig::new("SPX", DataType::EconomicIndicator);
    let key = config.key();
    let now = Utc::now();
    scheduler.register_source(config, now);

    let mut results = scheduler.take_results().unwrap();
    scheduler.tick(now).await.join().await;

    let job = scheduler.job(&key).unwrap();
    assert_eq!(job.last_run, Some(now));
    assert_eq!(job.next_run, now + chrono::Duration::hours(1));

    let result = results.try_recv().unwrap();
    assert_eq!(result.key(), key);
    assert!(result.has_changes);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_event_fires_at_most_once() {
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let now = Utc::now();

    scheduler.add_event(ScheduledEvent::new(
        "MSFT",
        EventType::Earnings,
        now - chrono::Duration::hours(1),
    ));
    // not yet past its buffer
    scheduler.add_event(ScheduledEvent::new("MSFT", EventType::GuidanceUpdate, now));

    let report = scheduler.tick(now).await;
    assert_eq!(report.events_triggered, 1);
    report.join().await;

    let report = scheduler.tick(now).await;
    assert_eq!(report.events_triggered, 0);
    report.join().await;

    assert_eq!(source.call_count(), 1);
    // one-shot: no recurring job is left behind
    assert!(scheduler
        .job(&SourceKey::new("MSFT", DataType::Earnings))
        .is_none());
    assert!(scheduler.jobs().is_empty());
    assert_eq!(scheduler.status().await.running_jobs, 0);

    let pending: Vec<EventType> = scheduler
        .events()
        .into_iter()
        .filter(|e| !e.triggered)
        .map(|e| e.event_type)
        .collect();
    assert_eq!(pending, vec![EventType::GuidanceUpdate]);
}

// ============================================================================
// Rate Limiting and Concurrency
// ============================================================================

#[tokio::test]
async fn test_rate_limited_job_stays_due() {
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler(
        source.clone(),
        SchedulerConfig {
            rate_limits: RateLimits {
                per_minute: 1,
                per_hour: 0,
                per_day: 0,
            },
            ..Default::default()
        },
    );
    let now = Utc::now();
    scheduler.register_source(SourceConfig::new("AAPL", DataType::Earnings), now);
    scheduler.register_source(SourceConfig::new("AAPL", DataType::Revenue), now);

    let report = scheduler.tick(now).await;
    assert_eq!(report.jobs_dispatched, 1);
    assert_eq!(report.rate_limited, 1);
    report.join().await;

    // earnings has the higher priority and went first
    let denied = scheduler
        .job(&SourceKey::new("AAPL", DataType::Revenue))
        .unwrap();
    assert_eq!(denied.next_run, now);
    assert_eq!(denied.retry_count, 0);
    assert!(!denied.running);

    let later = now + chrono::Duration::seconds(61);
    let report = scheduler.tick(later).await;
    assert_eq!(report.jobs_dispatched, 1);
    report.join().await;
    assert_eq!(source.call_count(), 2);
    assert_eq!(scheduler.rate_usage("AAPL", later).await.last_hour, 2);
}

#[tokio::test]
async fn test_running_job_is_not_reentered() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(GatedSource {
        gate: Arc::clone(&gate),
        calls: AtomicU32::new(0),
    });
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let config = SourceConfig::new("XAUUSD", DataType::EconomicIndicator);
    let key = config.key();
    let now = Utc::now();
    scheduler.register_source(config, now);

    let report = scheduler.tick(now).await;
    assert_eq!(report.jobs_dispatched, 1);
    assert!(scheduler.job(&key).unwrap().running);
    assert_eq!(scheduler.status().await.running_jobs, 1);

    let skipped = scheduler
        .trigger_immediate_update("XAUUSD", DataType::EconomicIndicator, "manual", now)
        .await
        .unwrap();
    assert!(skipped.is_none());

    let again = scheduler.tick(now).await;
    assert_eq!(again.jobs_dispatched, 0);

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), report.join())
        .await
        .unwrap();

    assert!(!scheduler.job(&key).unwrap().running);
    assert_eq!(source.calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_manual_trigger_returns_result_directly() {
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let mut results = scheduler.take_results().unwrap();
    let now = Utc::now();

    let result = tokio_test::assert_ok!(
        scheduler
            .trigger_immediate_update("EURUSD", DataType::EconomicIndicator, "manual", now)
            .await
    )
    .unwrap();
    assert!(result.has_changes);
    assert!(results.try_recv().is_err());

    assert!(scheduler
        .job(&SourceKey::new("EURUSD", DataType::EconomicIndicator))
        .is_none());
    assert_eq!(scheduler.rate_usage("EURUSD", now).await.last_minute, 1);

    // the one-shot slot is free again
    let again = scheduler
        .trigger_immediate_update("EURUSD", DataType::EconomicIndicator, "manual", now)
        .await
        .unwrap();
    assert!(again.is_some());
    assert_eq!(source.call_count(), 2);
}

#[tokio::test]
async fn test_event_during_run_makes_job_due_again() {
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(GatedSource {
        gate: Arc::clone(&gate),
        calls: AtomicU32::new(0),
    });
    let scheduler = scheduler(source.clone(), SchedulerConfig::default());
    let config = SourceConfig::new("XAUUSD", DataType::EconomicIndicator);
    let key = config.key();
    let now = Utc::now();
    scheduler.register_source(config, now);

    let report = scheduler.tick(now).await;
    assert_eq!(report.jobs_dispatched, 1);

    scheduler.add_event(ScheduledEvent::new(
        "XAUUSD",
        EventType::EconomicRelease,
        now - chrono::Duration::hours(1),
    ));
    let busy = scheduler.tick(now).await;
    assert_eq!(busy.events_triggered, 1);
    assert_eq!(busy.skipped_running, 1);
    assert!(scheduler.job(&key).unwrap().rerun_requested);

    gate.add_permits(2);
    tokio::time::timeout(Duration::from_secs(2), report.join())
        .await
        .unwrap();

    let job = scheduler.job(&key).unwrap();
    assert!(!job.rerun_requested);
    assert_eq!(job.next_run, now);

    let rerun = scheduler.tick(now).await;
    assert_eq!(rerun.jobs_dispatched, 1);
    rerun.join().await;
    assert_eq!(source.calls.load(Ordering::Relaxed), 2);
    assert_eq!(scheduler.job(&key).unwrap().next_run, now + chrono::Duration::hours(1));
}

// ============================================================================
// Results and Storage Failures
// ============================================================================

#[tokio::test]
async fn test_full_results_buffer_waits_for_consumer() {
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler(
        source.clone(),
        SchedulerConfig {
            result_buffer: 1,
            ..Default::default()
        },
    );
    let now = Utc::now();
    scheduler.register_source(SourceConfig::new("AAPL", DataType::Earnings), now);
    scheduler.register_source(SourceConfig::new("AAPL", DataType::Revenue), now);

    let mut results = scheduler.take_results().unwrap();
    let report = scheduler.tick(now).await;
    assert_eq!(report.jobs_dispatched, 2);

    let mut received = Vec::new();
    for _ in 0..2 {
        let result = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.has_changes);
        received.push(result.data_type);
    }
    received.sort();
    assert_eq!(received, vec![DataType::Earnings, DataType::Revenue]);

    tokio::time::timeout(Duration::from_secs(2), report.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_storage_failure_reaches_caller_and_backs_off() {
    let storage = Arc::new(FailingStorage {
        inner: MemoryStorage::new(),
        broken: DataType::Revenue,
    });
    let source = Arc::new(CountingSource::new(false));
    let scheduler = scheduler_with_storage(storage, source.clone(), SchedulerConfig::default());
    let now = Utc::now();
    let broken = SourceConfig::new("AAPL", DataType::Revenue);
    let healthy = SourceConfig::new("AAPL", DataType::Earnings);
    let (broken_key, healthy_key) = (broken.key(), healthy.key());
    scheduler.register_source(broken, now);
    scheduler.register_source(healthy, now + chrono::Duration::minutes(1));

    let err = scheduler
        .trigger_immediate_update("AAPL", DataType::Revenue, "manual", now)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));

    let job = scheduler.job(&broken_key).unwrap();
    assert!(!job.running);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.next_run, now + chrono::Duration::minutes(10));

    // the other job is untouched and runs normally
    let untouched = scheduler.job(&healthy_key).unwrap();
    assert_eq!(untouched.last_run, None);
    assert_eq!(untouched.retry_count, 0);

    let later = now + chrono::Duration::minutes(1);
    let report = scheduler.tick(later).await;
    assert_eq!(report.jobs_dispatched, 1);
    report.join().await;

    let job = scheduler.job(&healthy_key).unwrap();
    assert_eq!(job.last_run, Some(later));
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.next_run, later + job.interval);
    assert_eq!(scheduler.job(&broken_key).unwrap().retry_count, 1);
}
