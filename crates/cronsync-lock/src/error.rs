//! Error types for the lock crate.

use thiserror::Error;

/// Errors that can occur while acquiring or releasing a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// A quorum of pools did not grant the lock within the configured tries.
    #[error("lock not obtained for {key} after {tries} tries")]
    NotObtained { key: String, tries: u32 },

    /// The lock was no longer held by a quorum when released.
    #[error("lock expired before release: {key}")]
    Expired { key: String },

    /// A locker was built without any pools.
    #[error("no lock pools configured")]
    NoPools,

    /// A pool backend failed.
    #[error("lock pool error: {0}")]
    Pool(String),
}
