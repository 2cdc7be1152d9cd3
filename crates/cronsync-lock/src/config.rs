//! Locker configuration.

use std::time::Duration;

/// Default number of acquisition attempts.
pub const DEFAULT_TRIES: u32 = 32;

/// Default clock drift factor.
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;

/// Default per-pool timeout factor (fraction of the expiry).
pub const DEFAULT_TIMEOUT_FACTOR: f64 = 0.05;

/// Default lock expiry.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(8);

/// Default delay between acquisition attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Settings for a [`QuorumLocker`](crate::QuorumLocker).
#[derive(Debug, Clone, PartialEq)]
pub struct LockerConfig {
    /// Number of times lock acquisition is attempted.
    pub tries: u32,
    /// Clock drift factor, applied to the expiry when computing validity.
    pub drift_factor: f64,
    /// Per-pool request timeout as a fraction of the expiry.
    pub timeout_factor: f64,
    /// Time after which an unreleased lock lapses.
    pub expiry: Duration,
    /// Wait between acquisition attempts.
    pub retry_delay: Duration,
    /// Fixed owner value. Empty means a fresh random token per lock.
    ///
    /// A fixed value lets a lock be released from another process.
    pub value: String,
    /// Stop contacting pools as soon as a quorum has granted the lock.
    pub fail_fast: bool,
    /// Visit pools in random order on every attempt.
    pub shuffle_pools: bool,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            expiry: DEFAULT_EXPIRY,
            retry_delay: DEFAULT_RETRY_DELAY,
            value: String::new(),
            fail_fast: false,
            shuffle_pools: false,
        }
    }
}

impl LockerConfig {
    /// Replace unset (zero) values, and factors outside `(0, 1)`, with their
    /// defaults.
    pub fn normalized(mut self) -> Self {
        if self.tries == 0 {
            self.tries = DEFAULT_TRIES;
        }
        if !is_fraction(self.drift_factor) {
            self.drift_factor = DEFAULT_DRIFT_FACTOR;
        }
        if !is_fraction(self.timeout_factor) {
            self.timeout_factor = DEFAULT_TIMEOUT_FACTOR;
        }
        if self.expiry.is_zero() {
            self.expiry = DEFAULT_EXPIRY;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        self
    }

    /// Time allowed for a single pool to answer.
    pub fn pool_timeout(&self) -> Duration {
        self.fraction_of_expiry(self.timeout_factor)
    }

    /// Clock drift allowance subtracted from a lock's validity.
    pub fn drift(&self) -> Duration {
        // +2ms for the expiry precision of the backends
        self.fraction_of_expiry(self.drift_factor)
            .saturating_add(Duration::from_millis(2))
    }

    /// `expiry * factor`, capped at the expiry when not representable.
    fn fraction_of_expiry(&self, factor: f64) -> Duration {
        Duration::try_from_secs_f64(self.expiry.as_secs_f64() * factor).unwrap_or(self.expiry)
    }
}

fn is_fraction(factor: f64) -> bool {
    factor.is_finite() && factor > 0.0 && factor < 1.0
}
