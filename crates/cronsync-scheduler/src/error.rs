//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::JobType;

/// Errors raised while turning a job definition into an executable task.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No handler is registered for the job type.
    #[error("task not found: `{0}`")]
    TaskNotFound(JobType),
}

/// Errors returned by a task execution.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task ran and failed.
    #[error("task failed: {0}")]
    Failed(String),

    /// The payload could not be understood by the task.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The run exceeded its time budget.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// Shorthand for [`TaskError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Status label used when recording a run.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Failed(_) | Self::InvalidPayload(_) => "error",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Errors raised by a catalog reader.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing store could not be reached.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    /// The read was cancelled by the caller.
    #[error("catalog read cancelled")]
    Cancelled,
}

/// Errors raised by a scheduling engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// No job is registered under the engine identifier.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// Running jobs did not finish within the stop timeout.
    #[error("running jobs did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// Per-job failures during a reconciliation tick.
///
/// None of these abort the tick.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The job's task could not be resolved.
    #[error("failed to resolve task for job {job_id}: {source}")]
    Resolve {
        job_id: Uuid,
        #[source]
        source: ResolveError,
    },

    /// The engine rejected a new job.
    #[error("failed to add cron job {job_id}: {source}")]
    Add {
        job_id: Uuid,
        #[source]
        source: EngineError,
    },

    /// The engine rejected an updated definition.
    #[error("failed to update cron job {job_id}: {source}")]
    Update {
        job_id: Uuid,
        #[source]
        source: EngineError,
    },

    /// The engine could not remove a job.
    #[error("failed to remove cron job {name}: {source}")]
    Remove {
        name: String,
        #[source]
        source: EngineError,
    },
}

/// Errors from the scheduler facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler has been shut down and cannot be used again.
    #[error("scheduler is shut down")]
    ShutDown,

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The distributed lock could not be built.
    #[error("lock error: {0}")]
    Lock(#[from] cronsync_lock::LockError),
}
