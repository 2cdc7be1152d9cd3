//! Built-in task middleware.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{Instrument, error, field, info, info_span, warn};
use uuid::Uuid;

use crate::{JobDefinition, JobType, Middleware, Next, TaskError, TaskFuture};

/// Status label for a successful run.
pub const STATUS_OK: &str = "ok";

/// One timed task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSample {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub duration: Duration,
    /// `ok`, or the failing error's [`status`](crate::TaskError::status).
    pub status: &'static str,
}

/// Sink for [`TaskSample`]s.
pub trait SampleRecorder: Send + Sync {
    fn record(&self, sample: &TaskSample);
}

/// Recorder that emits each sample as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl SampleRecorder for LogRecorder {
    fn record(&self, sample: &TaskSample) {
        info!(
            job_id = %sample.job_id,
            job_type = %sample.job_type,
            duration_ms = sample.duration.as_millis() as u64,
            status = sample.status,
            "task run time"
        );
    }
}

/// Measures how long each invocation takes.
pub struct TimingMiddleware {
    recorder: Arc<dyn SampleRecorder>,
}

impl TimingMiddleware {
    /// Timing middleware reporting through [`LogRecorder`].
    pub fn new() -> Self {
        Self::with_recorder(Arc::new(LogRecorder))
    }

    /// Timing middleware reporting to `recorder`.
    pub fn with_recorder(recorder: Arc<dyn SampleRecorder>) -> Self {
        Self { recorder }
    }
}

impl Default for TimingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for TimingMiddleware {
    fn handle(&self, job: Arc<JobDefinition>, next: Next) -> TaskFuture {
        let recorder = Arc::clone(&self.recorder);
        let job_id = job.id;
        let job_type = job.job_type.clone();

        Box::pin(async move {
            let started = Instant::now();
            let result = next.run(job).await;

            recorder.record(&TaskSample {
                job_id,
                job_type,
                duration: started.elapsed(),
                status: match &result {
                    Ok(()) => STATUS_OK,
                    Err(e) => e.status(),
                },
            });
            result
        })
    }
}

/// Fails a run with [`TaskError::Timeout`] once it exceeds a time budget.
///
/// The rest of the chain is dropped at the deadline, so the task stops at
/// its next await point.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    limit: Duration,
}

impl TimeoutMiddleware {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle(&self, job: Arc<JobDefinition>, next: Next) -> TaskFuture {
        let limit = self.limit;
        let job_id = job.id;

        Box::pin(async move {
            match timeout(limit, next.run(job)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job_id = %job_id, limit = ?limit, "job exceeded its time budget");
                    Err(TaskError::Timeout(limit))
                }
            }
        })
    }
}

/// Runs each invocation inside an `execute.job` span.
///
/// Failures are recorded on the span (`error`, `otel.status_code`) and
/// logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl TracingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for TracingMiddleware {
    fn handle(&self, job: Arc<JobDefinition>, next: Next) -> TaskFuture {
        let span = info_span!(
            "execute.job",
            job_id = %job.id,
            job_type = %job.job_type,
            otel.status_code = field::Empty,
            error = field::Empty,
        );
        let job_id = job.id;
        let job_type = job.job_type.clone();

        Box::pin(async move {
            let result = next.run(job).instrument(span.clone()).await;

            if let Err(e) = &result {
                span.record("otel.status_code", "ERROR");
                span.record("error", field::display(e));
                span.in_scope(|| {
                    error!(job_id = %job_id, job_type = %job_type, error = %e, "job execution failed");
                });
            }
            result
        })
    }
}
