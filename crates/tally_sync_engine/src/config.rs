//! Engine settings.
//!
//! [`SyncConfig`] is passed to the coordinator once at construction.
//! Every setting has a default suitable for a phone on a flaky network.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COMPACT_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-item retry budget and auto-sync backoff.
    pub retry: RetryConfig,
    /// Period of the automatic sync loop. `None` disables it.
    pub sync_interval: Option<Duration>,
    /// Upper bound on every remote call; hitting it counts as a network error.
    pub request_timeout: Duration,
    /// Log size in bytes past which the store is compacted.
    pub compact_threshold: u64,
    /// Whether deleting a never-synced entity skips the server entirely.
    pub collapse_unsynced_deletes: bool,
}

impl SyncConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            sync_interval: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            collapse_unsynced_deletes: true,
        }
    }

    /// Replaces the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Turns on the automatic sync loop.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Bounds each remote call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the log size that triggers compaction.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Chooses whether a create followed by a delete skips the server.
    pub fn with_collapse_unsynced_deletes(mut self, collapse: bool) -> Self {
        self.collapse_unsynced_deletes = collapse;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How often a change is retried, and how long the auto-sync loop backs
/// off after transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Shipping attempts per queue item before it is parked as failed.
    pub max_attempts: u32,
    /// Backoff after the first failure.
    pub initial_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub backoff_multiplier: f64,
    /// Spread retries by up to a quarter of the delay.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Gives up on an item after `max_attempts` transient failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Parks an item on its first failure and never waits.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the first backoff.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the backoff ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true once `attempts` has used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Backoff before retrying after `failures` consecutive failures.
    ///
    /// Zero failures means no wait. The delay grows by
    /// `backoff_multiplier` per failure and is capped at `max_delay`
    /// before jitter is added.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let steps = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let uncapped = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(steps);
        let capped = uncapped.min(self.max_delay.as_secs_f64());

        let spread = if self.add_jitter {
            capped * 0.25 * clock_fraction()
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + spread)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

/// A value in `[0, 1)` taken from the clock's sub-second part.
fn clock_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}
