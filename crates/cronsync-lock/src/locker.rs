//! Quorum locker.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{LockError, LockPool, LockerConfig};

/// Hands out locks keyed by name.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the lock for `key`, retrying as configured.
    async fn lock(&self, key: &str) -> Result<Box<dyn Lock>, LockError>;
}

/// A held lock.
#[async_trait]
pub trait Lock: Send + Sync {
    /// The key this lock guards.
    fn key(&self) -> &str;

    /// Release the lock.
    async fn unlock(&self) -> Result<(), LockError>;
}

struct Inner {
    config: LockerConfig,
    pools: Vec<Arc<dyn LockPool>>,
    quorum: usize,
}

/// Locker that holds a lock once a majority of its pools grant it.
///
/// Each attempt asks every pool (bounded by `expiry * timeout_factor`), then
/// checks that a quorum answered and that the remaining validity, after
/// subtracting elapsed time and clock drift, is still positive. Failed
/// attempts release whatever was granted and wait `retry_delay`.
#[derive(Clone)]
pub struct QuorumLocker {
    inner: Arc<Inner>,
}

impl QuorumLocker {
    /// Create a locker over `pools`.
    pub fn new(config: LockerConfig, pools: Vec<Arc<dyn LockPool>>) -> Result<Self, LockError> {
        if pools.is_empty() {
            return Err(LockError::NoPools);
        }

        let quorum = pools.len() / 2 + 1;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.normalized(),
                pools,
                quorum,
            }),
        })
    }

    /// Number of pools that must grant a lock.
    pub fn quorum(&self) -> usize {
        self.inner.quorum
    }

    /// Effective configuration.
    pub fn config(&self) -> &LockerConfig {
        &self.inner.config
    }

    fn owner_value(&self) -> String {
        if self.inner.config.value.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.inner.config.value.clone()
        }
    }
}

impl Inner {
    fn ordered_pools(&self) -> Vec<Arc<dyn LockPool>> {
        let mut pools = self.pools.clone();
        if self.config.shuffle_pools {
            pools.shuffle(&mut rand::thread_rng());
        }
        pools
    }

    async fn acquire_all(&self, key: &str, value: &str) -> usize {
        let pool_timeout = self.config.pool_timeout();
        let mut granted = 0;

        for pool in self.ordered_pools() {
            match timeout(pool_timeout, pool.acquire(key, value, self.config.expiry)).await {
                Ok(Ok(true)) => granted += 1,
                Ok(Ok(false)) => trace!(key, "pool refused lock"),
                Ok(Err(e)) => debug!(key, error = %e, "pool failed to acquire lock"),
                Err(_) => debug!(key, "pool timed out acquiring lock"),
            }

            if self.config.fail_fast && granted >= self.quorum {
                break;
            }
        }

        granted
    }

    async fn release_all(&self, key: &str, value: &str) -> usize {
        let pool_timeout = self.config.pool_timeout();
        let mut released = 0;

        for pool in self.ordered_pools() {
            match timeout(pool_timeout, pool.release(key, value)).await {
                Ok(Ok(true)) => released += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(key, error = %e, "pool failed to release lock"),
                Err(_) => debug!(key, "pool timed out releasing lock"),
            }
        }

        released
    }
}

#[async_trait]
impl Locker for QuorumLocker {
    async fn lock(&self, key: &str) -> Result<Box<dyn Lock>, LockError> {
        let inner = &self.inner;
        let value = self.owner_value();

        for attempt in 0..inner.config.tries {
            if attempt > 0 {
                sleep(inner.config.retry_delay).await;
            }

            let started = Instant::now();
            let granted = inner.acquire_all(key, &value).await;
            let spent = started.elapsed() + inner.config.drift();

            if granted >= inner.quorum && spent < inner.config.expiry {
                trace!(key, attempt, granted, "lock obtained");
                return Ok(Box::new(QuorumLock {
                    inner: Arc::clone(inner),
                    key: key.to_string(),
                    value,
                }));
            }

            inner.release_all(key, &value).await;
        }

        Err(LockError::NotObtained {
            key: key.to_string(),
            tries: inner.config.tries,
        })
    }
}

struct QuorumLock {
    inner: Arc<Inner>,
    key: String,
    value: String,
}

#[async_trait]
impl Lock for QuorumLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let released = self.inner.release_all(&self.key, &self.value).await;
        if released >= self.inner.quorum {
            Ok(())
        } else {
            warn!(key = %self.key, released, quorum = self.inner.quorum, "lock lapsed before release");
            Err(LockError::Expired {
                key: self.key.clone(),
            })
        }
    }
}
