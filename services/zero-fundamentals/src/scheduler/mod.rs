//! Update scheduler.
//!
//! Owns one recurring job per `(asset, data_type)` and a calendar of one-shot
//! events. A coordinating loop wakes every tick and runs two passes:
//!
//! - **Job pass**: due jobs sorted by `(priority desc, next_run asc)` are
//!   admitted through the per-asset rate limiter and then the worker pool.
//! - **Event pass**: due events are marked triggered first, then dispatched
//!   as immediate updates for the event's data type. An event whose job is
//!   already running makes that job due again once it finishes.
//!
//! Events and manual triggers for keys without a registered job run as
//! one-shot updates and leave no job behind.
//!
//! The loop blocks only on pool admission. Each dispatch runs in its own task
//! and reports its `ChangeDetectionResult` on the results channel, waiting for
//! the consumer when the buffer is full. Manual triggers return their result
//! to the caller instead.

mod event;
mod job;
mod rate_limiter;

pub use event::{EventType, ScheduledEvent};
pub use job::{backoff_delay, ScheduledJob};
pub use rate_limiter::{AssetRateLimiter, RateLimits, RateUsage};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::data::{DataType, SourceConfig, SourceKey};
use crate::detection::{ChangeDetectionEngine, ChangeDetectionResult};
use crate::storage::StorageResult;

// ============================================================================
// Configuration and State
// ============================================================================

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Worker pool size
    pub max_parallel_requests: usize,
    pub max_retries: u32,
    pub rate_limits: RateLimits,
    /// Capacity of the results channel
    pub result_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_parallel_requests: 4,
            max_retries: 3,
            rate_limits: RateLimits::default(),
            result_buffer: 256,
        }
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

/// Point-in-time scheduler status.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub total_jobs: usize,
    pub running_jobs: usize,
    pub pending_events: usize,
    pub max_parallel_requests: usize,
    /// running_jobs / max_parallel_requests
    pub system_load: f64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub jobs_dispatched: usize,
    pub events_triggered: usize,
    pub rate_limited: usize,
    pub skipped_running: usize,
    /// Dispatched tasks; the loop does not wait on them
    pub handles: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every task dispatched by this tick.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatched update task failed");
            }
        }
    }
}

/// Result of trying to admit one dispatch.
enum Admission {
    Admitted(SourceConfig, OwnedSemaphorePermit),
    Busy,
    RateLimited,
    Closed,
}

// ============================================================================
// UpdateScheduler
// ============================================================================

/// Dispatches change detection for due jobs and events.
pub struct UpdateScheduler {
    config: SchedulerConfig,
    engine: Arc<ChangeDetectionEngine>,
    limiter: AssetRateLimiter,
    jobs: Mutex<HashMap<SourceKey, ScheduledJob>>,
    /// Keys of in-flight one-shot updates without a job
    one_shot: Mutex<HashSet<SourceKey>>,
    events: Mutex<Vec<ScheduledEvent>>,
    pool: Arc<Semaphore>,
    state: RwLock<SchedulerState>,
    last_tick: RwLock<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    results_tx: mpsc::Sender<ChangeDetectionResult>,
    results_rx: Mutex<Option<mpsc::Receiver<ChangeDetectionResult>>>,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<ChangeDetectionEngine>) -> Self {
        let (results_tx, results_rx) = mpsc::channel(config.result_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            limiter: AssetRateLimiter::new(config.rate_limits),
            pool: Arc::new(Semaphore::new(config.max_parallel_requests.max(1))),
            config,
            engine,
            jobs: Mutex::new(HashMap::new()),
            one_shot: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
            state: RwLock::new(SchedulerState::Stopped),
            last_tick: RwLock::new(None),
            shutdown,
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<SourceKey, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_one_shot(&self) -> MutexGuard<'_, HashSet<SourceKey>> {
        self.one_shot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<ScheduledEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register (or replace) the job for a source, due at `now`.
    pub fn register_source(&self, source: SourceConfig, now: DateTime<Utc>) {
        let key = source.key();
        let job = ScheduledJob::new(source, self.config.max_retries, now);
        debug!(job = %key, priority = ?job.priority, "Registered job");
        self.lock_jobs().insert(key, job);
    }

    pub fn add_event(&self, event: ScheduledEvent) {
        info!(
            event_id = %event.id,
            asset = %event.asset,
            event_type = %event.event_type,
            fire_time = %event.fire_time(),
            "Scheduled event added"
        );
        self.lock_events().push(event);
    }

    /// Copy of every job, ordered by key.
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.lock_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));
        jobs
    }

    pub fn job(&self, key: &SourceKey) -> Option<ScheduledJob> {
        self.lock_jobs().get(key).cloned()
    }

    pub fn events(&self) -> Vec<ScheduledEvent> {
        self.lock_events().clone()
    }

    /// Take the receiving end of the results channel. Returns `None` once taken.
    pub fn take_results(&self) -> Option<mpsc::Receiver<ChangeDetectionResult>> {
        self.results_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub async fn rate_usage(&self, asset: &str, now: DateTime<Utc>) -> RateUsage {
        self.limiter.usage(asset, now).await
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub async fn get_state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Clear any earlier stop and enter `Running`.
    ///
    /// Call before spawning `run` so a `stop` issued right after the spawn is
    /// never lost.
    pub async fn prepare_run(&self) {
        let mut state = self.state.write().await;
        self.shutdown.send_replace(false);
        *state = SchedulerState::Running;
    }

    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        *state = SchedulerState::Stopped;
        self.shutdown.send_replace(true);
        drop(state);
        info!("Update scheduler stopped");
    }

    pub async fn pause(&self) {
        *self.state.write().await = SchedulerState::Paused;
        info!("Update scheduler paused");
    }

    pub async fn resume(&self) {
        *self.state.write().await = SchedulerState::Running;
        info!("Update scheduler resumed");
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (total_jobs, running_jobs) = {
            let jobs = self.lock_jobs();
            let one_shot = self.lock_one_shot().len();
            (jobs.len(), jobs.values().filter(|j| j.running).count() + one_shot)
        };
        let pending_events = self.lock_events().iter().filter(|e| !e.triggered).count();
        let max_parallel_requests = self.config.max_parallel_requests.max(1);

        SchedulerStatus {
            state: self.get_state().await,
            total_jobs,
            running_jobs,
            pending_events,
            max_parallel_requests,
            system_load: running_jobs as f64 / max_parallel_requests as f64,
            last_tick: *self.last_tick.read().await,
        }
    }

    // ------------------------------------------------------------------------
    // Main Loop
    // ------------------------------------------------------------------------

    /// Run the tick loop until `stop` is called.
    ///
    /// Returns at once if a stop is already pending; use `prepare_run` to
    /// restart a stopped scheduler.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = {
            let mut state = self.state.write().await;
            let shutdown_rx = self.shutdown.subscribe();
            let stopped = *shutdown_rx.borrow();
            if stopped {
                info!("Stop already requested, scheduler loop not started");
                return;
            }
            *state = SchedulerState::Running;
            shutdown_rx
        };

        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            max_parallel = self.config.max_parallel_requests,
            jobs = self.lock_jobs().len(),
            "Update scheduler started"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.get_state().await {
                        SchedulerState::Stopped => break,
                        SchedulerState::Paused => continue,
                        SchedulerState::Running => {
                            let report = self.tick(Utc::now()).await;
                            if report.jobs_dispatched + report.events_triggered > 0 {
                                debug!(
                                    dispatched = report.jobs_dispatched,
                                    events = report.events_triggered,
                                    rate_limited = report.rate_limited,
                                    "Tick complete"
                                );
                            }
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Update scheduler loop exited");
    }

    /// Run one job pass and one event pass at `now`.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        *self.last_tick.write().await = Some(now);
        let mut report = TickReport::default();

        // Job pass
        for key in self.due_jobs(now) {
            if self.stop_requested() {
                debug!("Stop requested, ending job pass");
                return report;
            }
            match self.admit(&key, now).await {
                Admission::Admitted(source, permit) => {
                    report.jobs_dispatched += 1;
                    report.handles.push(self.spawn_update(source, permit, now, "scheduled"));
                }
                Admission::Busy => report.skipped_running += 1,
                Admission::RateLimited => report.rate_limited += 1,
                Admission::Closed => return report,
            }
        }

        // Event pass
        for event in self.claim_due_events(now) {
            if self.stop_requested() {
                break;
            }
            report.events_triggered += 1;
            let key = SourceKey::new(event.asset.clone(), event.data_type());
            info!(
                event_id = %event.id,
                job = %key,
                event_type = %event.event_type,
                "Scheduled event triggered"
            );

            match self.admit(&key, now).await {
                Admission::Admitted(source, permit) => {
                    report.handles.push(self.spawn_update(source, permit, now, "event"));
                }
                Admission::Busy => {
                    if let Some(job) = self.lock_jobs().get_mut(&key) {
                        job.rerun_requested = true;
                    }
                    debug!(job = %key, "Event update already in flight, rerun requested");
                    report.skipped_running += 1;
                }
                Admission::RateLimited => {
                    // retried by the next job pass, or by the next event pass
                    // for keys without a job
                    match self.lock_jobs().get_mut(&key) {
                        Some(job) => job.next_run = now,
                        None => self.rearm_event(&event.id),
                    }
                    report.rate_limited += 1;
                }
                Admission::Closed => break,
            }
        }

        report
    }

    /// Run an update for one key right away and wait for its result.
    ///
    /// Keys without a registered job run once with default source settings.
    /// Returns `Ok(None)` when the key is already running or the rate limiter
    /// denies the request.
    pub async fn trigger_immediate_update(
        self: &Arc<Self>,
        asset: &str,
        data_type: DataType,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ChangeDetectionResult>> {
        let key = SourceKey::new(asset, data_type);

        match self.admit(&key, now).await {
            Admission::Admitted(source, permit) => {
                info!(job = %key, reason = %reason, "Immediate update triggered");
                let result = self.execute(source, now, reason).await;
                drop(permit);
                result.map(Some)
            }
            Admission::Busy => {
                debug!(job = %key, reason = %reason, "Job already running, trigger skipped");
                Ok(None)
            }
            Admission::RateLimited => {
                debug!(job = %key, reason = %reason, "Trigger denied by rate limiter");
                Ok(None)
            }
            Admission::Closed => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<SourceKey> {
        let jobs = self.lock_jobs();
        let mut due: Vec<&ScheduledJob> = jobs.values().filter(|j| j.is_due(now)).collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_run.cmp(&b.next_run))
                .then_with(|| a.key().cmp(&b.key()))
        });
        due.into_iter().map(ScheduledJob::key).collect()
    }

    /// Mark due events triggered before anything is dispatched.
    fn claim_due_events(&self, now: DateTime<Utc>) -> Vec<ScheduledEvent> {
        let mut events = self.lock_events();
        let mut claimed = Vec::new();
        for event in events.iter_mut().filter(|e| e.is_due(now)) {
            event.triggered = true;
            claimed.push(event.clone());
        }
        claimed
    }

    fn rearm_event(&self, id: &str) {
        if let Some(event) = self.lock_events().iter_mut().find(|e| e.id == id) {
            event.triggered = false;
        }
    }

    /// Claim the job (or a one-shot slot), then the rate limiter, then a
    /// worker slot.
    async fn admit(&self, key: &SourceKey, now: DateTime<Utc>) -> Admission {
        let source = {
            let mut jobs = self.lock_jobs();
            match jobs.get_mut(key) {
                Some(job) if job.running => return Admission::Busy,
                Some(job) => {
                    job.running = true;
                    job.source.clone()
                }
                None => {
                    if !self.lock_one_shot().insert(key.clone()) {
                        return Admission::Busy;
                    }
                    SourceConfig::new(key.asset.clone(), key.data_type)
                }
            }
        };

        if !self.limiter.try_acquire(&key.asset, now).await {
            self.release(key);
            return Admission::RateLimited;
        }

        match Arc::clone(&self.pool).acquire_owned().await {
            Ok(permit) => Admission::Admitted(source, permit),
            Err(_) => {
                self.release(key);
                Admission::Closed
            }
        }
    }

    fn release(&self, key: &SourceKey) {
        match self.lock_jobs().get_mut(key) {
            Some(job) => job.running = false,
            None => {
                self.lock_one_shot().remove(key);
            }
        }
    }

    fn spawn_update(
        self: &Arc<Self>,
        source: SourceConfig,
        permit: OwnedSemaphorePermit,
        now: DateTime<Utc>,
        reason: &'static str,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = scheduler.execute(source, now, reason).await;
            drop(permit);
            // storage errors are already logged and recorded on the job
            if let Ok(result) = outcome {
                let key = result.key();
                if scheduler.results_tx.send(result).await.is_err() {
                    warn!(job = %key, "Results channel closed, dropping result");
                }
            }
        })
    }

    /// Run change detection for a claimed job and update its schedule.
    async fn execute(
        &self,
        source: SourceConfig,
        now: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<ChangeDetectionResult> {
        let mut guard = RunningGuard::new(self, source.key());
        let outcome = self.engine.check_source(&source, now).await;

        match &outcome {
            Ok(result) => guard.complete(now, !result.is_failure()),
            Err(e) => {
                error!(job = %guard.key, reason = %reason, error = %e, "Storage failure during update");
                guard.complete(now, false);
            }
        }

        outcome
    }
}

// ============================================================================
// Running Guard
// ============================================================================

/// Clears the job's `running` flag on drop and applies the outcome, if any.
/// One-shot updates only free their slot.
struct RunningGuard<'a> {
    scheduler: &'a UpdateScheduler,
    key: SourceKey,
    completion: Option<(DateTime<Utc>, bool)>,
}

impl<'a> RunningGuard<'a> {
    fn new(scheduler: &'a UpdateScheduler, key: SourceKey) -> Self {
        Self {
            scheduler,
            key,
            completion: None,
        }
    }

    fn complete(&mut self, now: DateTime<Utc>, succeeded: bool) {
        self.completion = Some((now, succeeded));
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut jobs = self.scheduler.lock_jobs();
        let Some(job) = jobs.get_mut(&self.key) else {
            self.scheduler.lock_one_shot().remove(&self.key);
            return;
        };
        job.running = false;

        match self.completion {
            Some((now, true)) => job.record_success(now),
            Some((now, false)) => match job.record_failure(now) {
                Some(delay) => warn!(
                    job = %self.key,
                    retry = job.retry_count,
                    delay_mins = delay.num_minutes(),
                    "Update failed, backing off"
                ),
                None => warn!(
                    job = %self.key,
                    next_run = %job.next_run,
                    "Update failed, retries exhausted, resuming normal interval"
                ),
            },
            None => {}
        }

        if job.rerun_requested {
            job.rerun_requested = false;
            if let Some((now, _)) = self.completion {
                job.next_run = now;
                debug!(job = %self.key, "Rerun requested during update, due again");
            }
        }
    }
}
