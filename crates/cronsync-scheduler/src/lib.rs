//! Cron scheduler kept in step with a job catalog.
//!
//! This crate provides:
//! - A task registry that wraps every job run in a middleware chain
//! - A reconciler that adds, updates and removes scheduled jobs so they
//!   match the enabled definitions in a catalog
//! - A facade that runs the reconciler on an interval next to an in-process
//!   cron engine guarded by a distributed lock

mod catalog;
mod config;
mod engine;
mod error;
mod middleware;
mod scheduler;
mod syncer;
mod task;
mod types;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, JsonFileCatalog, MemoryCatalog};
pub use config::{
    DEFAULT_STOP_TIMEOUT, DEFAULT_SYNC_INTERVAL, MIN_SYNC_INTERVAL, SchedulerConfig, default_limit,
};
pub use engine::{Engine, JobListener, LocalEngine, LocalEngineBuilder, LogListener, parse_schedule};
pub use error::{CatalogError, EngineError, ResolveError, SchedulerError, SyncError, TaskError};
pub use middleware::{
    LogRecorder, STATUS_OK, SampleRecorder, TaskSample, TimeoutMiddleware, TimingMiddleware,
    TracingMiddleware,
};
pub use scheduler::{Lifecycle, Scheduler};
pub use syncer::{JobSyncer, PAGE_SIZE, SyncOutcome, SyncReport, Syncer, should_update};
pub use task::{Middleware, Next, ResolvedTask, Resolver, Task, TaskFuture, TaskRegistry};
pub use types::{CronDefinition, JOB_TAG, JobDefinition, JobOptions, JobType, LiveJob};

pub use cronsync_lock as lock;
