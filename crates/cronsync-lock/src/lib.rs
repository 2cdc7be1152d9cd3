//! Distributed mutual exclusion for cronsync.
//!
//! A [`Locker`] hands out [`Lock`]s keyed by job name. The scheduling engine
//! takes a lock before firing a job so that only one of several cooperating
//! instances runs it. [`QuorumLocker`] holds a lock when a majority of its
//! [`LockPool`] backends grant it; [`MemoryPool`] is an in-process backend.

mod config;
mod error;
mod locker;
mod pool;

pub use config::LockerConfig;
pub use error::LockError;
pub use locker::{Lock, Locker, QuorumLocker};
pub use pool::{LockPool, MemoryPool};
