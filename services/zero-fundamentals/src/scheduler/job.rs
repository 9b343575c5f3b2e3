//! Recurring jobs and retry backoff.

use chrono::{DateTime, Duration, Utc};

use crate::data::{Priority, SourceConfig, SourceKey};

/// Backoff base in minutes.
const BACKOFF_BASE_MINUTES: i64 = 5;
/// Backoff ceiling in minutes.
const BACKOFF_CAP_MINUTES: i64 = 60;

/// Delay before retry number `retry_count`: `min(5 * 2^retry_count, 60)` minutes.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let factor = 2_i64.checked_pow(retry_count).unwrap_or(i64::MAX);
    let minutes = BACKOFF_BASE_MINUTES
        .saturating_mul(factor)
        .min(BACKOFF_CAP_MINUTES);
    Duration::minutes(minutes)
}

/// One recurring check of an `(asset, data_type)` source.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub source: SourceConfig,
    pub priority: Priority,
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    /// At most one execution per key at a time
    pub running: bool,
    /// Set when an event lands mid-run; the job is due again on completion
    pub rerun_requested: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ScheduledJob {
    /// A job due immediately, taking interval and priority from the source.
    pub fn new(source: SourceConfig, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            priority: source.priority,
            interval: source.check_frequency,
            source,
            next_run: now,
            last_run: None,
            running: false,
            rerun_requested: false,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn key(&self) -> SourceKey {
        self.source.key()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.running && self.next_run <= now
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.retry_count = 0;
        self.next_run = now + self.interval;
    }

    /// Reschedule after a failure.
    ///
    /// Returns the backoff delay, or `None` once retries are exhausted and
    /// the job falls back to its normal interval.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_run = Some(now);
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            let delay = backoff_delay(self.retry_count);
            self.next_run = now + delay;
            Some(delay)
        } else {
            self.retry_count = 0;
            self.next_run = now + self.interval;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use test_case::test_case;

    #[test_case(0, 5 ; "base")]
    #[test_case(1, 10 ; "first retry")]
    #[test_case(2, 20 ; "second retry")]
    #[test_case(3, 40 ; "third retry")]
    #[test_case(4, 60 ; "capped")]
    #[test_case(63, 60 ; "overflow is capped")]
    #[test_case(200, 60 ; "huge exponent is capped")]
    fn test_backoff_delay(retry: u32, minutes: i64) {
        assert_eq!(backoff_delay(retry), Duration::minutes(minutes));
    }

    #[test]
    fn test_failure_sequence_resets_after_max_retries() {
        let now = Utc::now();
        let source = SourceConfig::new("AAPL", DataType::Earnings);
        let mut job = ScheduledJob::new(source, 3, now);

        assert_eq!(job.record_failure(now), Some(Duration::minutes(10)));
        assert_eq!(job.record_failure(now), Some(Duration::minutes(20)));
        assert_eq!(job.record_failure(now), Some(Duration::minutes(40)));
        assert_eq!(job.retry_count, 3);

        assert_eq!(job.record_failure(now), None);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.next_run, now + job.interval);
    }

    #[test]
    fn test_success_resets_retries() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(SourceConfig::new("AAPL", DataType::Roe), 3, now);
        assert!(job.is_due(now));

        job.record_failure(now);
        job.record_success(now);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.next_run, now + Duration::hours(24));
        assert!(!job.is_due(now));

        job.next_run = now;
        job.running = true;
        assert!(!job.is_due(now));
    }
}
