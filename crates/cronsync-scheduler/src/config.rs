//! Scheduler configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use cronsync_lock::LockerConfig;

/// Default interval between reconciliation ticks.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Shortest accepted reconciliation interval. Anything below falls back to
/// [`DEFAULT_SYNC_INTERVAL`].
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default wait for in-flight jobs when stopping.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default concurrency ceiling: the host's available parallelism.
pub fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Settings for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub limit: usize,
    /// Interval between reconciliation ticks.
    pub sync: Duration,
    /// How long stopping waits for in-flight jobs.
    pub stop_timeout: Duration,
    /// Distributed lock settings.
    pub locker: LockerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            sync: DEFAULT_SYNC_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            locker: LockerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Replace unset or out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.limit == 0 {
            self.limit = default_limit();
        }
        if self.stop_timeout.is_zero() {
            self.stop_timeout = DEFAULT_STOP_TIMEOUT;
        }
        if self.sync < MIN_SYNC_INTERVAL {
            self.sync = DEFAULT_SYNC_INTERVAL;
        }
        self.locker = self.locker.normalized();
        self
    }
}
