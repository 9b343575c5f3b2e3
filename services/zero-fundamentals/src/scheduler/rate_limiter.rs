//! Per-asset sliding window rate limiter.
//!
//! Every dispatch for an asset (scheduled job, event or manual trigger)
//! consumes one request from three windows: minute, hour and day. A request
//! is admitted only if all three have room. State lives behind a single lock
//! so concurrent workers cannot undercount.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;
use zero_common::config::RateLimitConfig;

/// Request ceilings per window. Zero disables a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimits {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            per_minute: config.per_minute,
            per_hour: config.per_hour,
            per_day: config.per_day,
        }
    }
}

/// Requests counted in each window for one asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateUsage {
    pub last_minute: usize,
    pub last_hour: usize,
    pub last_day: usize,
}

/// Sliding window limiter keyed by asset.
#[derive(Debug)]
pub struct AssetRateLimiter {
    limits: RateLimits,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl AssetRateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Admit one request for `asset` at `now`, or deny without queueing.
    pub async fn try_acquire(&self, asset: &str, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().await;
        let history = windows.entry(asset.to_string()).or_default();
        prune(history, now);

        let usage = count(history, now);
        let exceeded = [
            (usage.last_minute, self.limits.per_minute, "minute"),
            (usage.last_hour, self.limits.per_hour, "hour"),
            (usage.last_day, self.limits.per_day, "day"),
        ]
        .into_iter()
        .find(|(used, limit, _)| *limit > 0 && *used >= *limit as usize);

        if let Some((used, limit, window)) = exceeded {
            debug!(asset = %asset, window, used, limit, "Rate limit reached");
            return false;
        }

        history.push_back(now);
        true
    }

    pub async fn usage(&self, asset: &str, now: DateTime<Utc>) -> RateUsage {
        let windows = self.windows.lock().await;
        windows
            .get(asset)
            .map(|history| count(history, now))
            .unwrap_or_default()
    }
}

fn prune(history: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let horizon = now - Duration::days(1);
    while history.front().is_some_and(|ts| *ts <= horizon) {
        history.pop_front();
    }
}

fn count(history: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> RateUsage {
    let within = |window: Duration| history.iter().filter(|ts| **ts > now - window).count();
    RateUsage {
        last_minute: within(Duration::minutes(1)),
        last_hour: within(Duration::hours(1)),
        last_day: within(Duration::days(1)),
    }
}
