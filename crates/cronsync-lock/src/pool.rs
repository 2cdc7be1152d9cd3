//! Lock pool backends.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::LockError;

/// One independent backend a [`QuorumLocker`](crate::QuorumLocker) votes on.
///
/// Implementations must give set-if-absent semantics: `acquire` succeeds only
/// when no live entry exists for the key, and `release` removes the entry
/// only when it is still owned by `value`.
#[async_trait]
pub trait LockPool: Send + Sync {
    /// Try to create `key` owned by `value` for `expiry`.
    async fn acquire(&self, key: &str, value: &str, expiry: Duration) -> Result<bool, LockError>;

    /// Delete `key` if it is owned by `value`.
    async fn release(&self, key: &str, value: &str) -> Result<bool, LockError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process lock pool.
///
/// Useful for a single instance or for tests. Cooperating processes need a
/// shared backend instead.
#[derive(Debug, Default)]
pub struct MemoryPool {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of `key`, if the entry has not lapsed.
    pub fn owner(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl LockPool for MemoryPool {
    async fn acquire(&self, key: &str, value: &str, expiry: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + expiry,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(key) {
            Some(entry) if entry.value == value && entry.expires_at > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
