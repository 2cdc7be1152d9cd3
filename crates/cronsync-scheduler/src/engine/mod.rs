//! Scheduling engine contract.
//!
//! An engine owns registered jobs, fires them on their cron schedule and
//! reports when each last ran. The reconciler only ever talks to this trait.

mod local;

pub use local::{LocalEngine, LocalEngineBuilder, parse_schedule};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::{CronDefinition, EngineError, JobOptions, LiveJob, ResolvedTask, TaskError};

/// A cron scheduling engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Snapshot of every registered job.
    async fn jobs(&self) -> Vec<LiveJob>;

    /// When the job last fired. `Ok(None)` if it never has.
    async fn last_run(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, EngineError>;

    /// Register a new job.
    async fn add_job(
        &self,
        definition: CronDefinition,
        task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError>;

    /// Replace the schedule, task and options of the job `id`, keeping `id`.
    async fn update_job(
        &self,
        id: Uuid,
        definition: CronDefinition,
        task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError>;

    /// Unregister the job `id`.
    async fn remove_job(&self, id: Uuid) -> Result<(), EngineError>;

    /// Begin firing jobs.
    async fn start(&self) -> Result<(), EngineError>;

    /// Stop firing jobs and wait for in-flight runs. Jobs stay registered.
    async fn stop_jobs(&self) -> Result<(), EngineError>;

    /// Stop for good.
    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Observer of job executions.
pub trait JobListener: Send + Sync {
    fn on_job_start(&self, _job: &LiveJob) {}

    fn on_job_stop(&self, _job: &LiveJob) {}

    fn on_job_error(&self, _job: &LiveJob, _error: &TaskError) {}
}

/// Listener that logs every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl JobListener for LogListener {
    fn on_job_start(&self, job: &LiveJob) {
        info!(engine_id = %job.id, job_id = %job.name, "job start running");
    }

    fn on_job_stop(&self, job: &LiveJob) {
        info!(engine_id = %job.id, job_id = %job.name, "job stop running");
    }

    fn on_job_error(&self, job: &LiveJob, e: &TaskError) {
        error!(engine_id = %job.id, job_id = %job.name, error = %e, "job stop running with error");
    }
}
