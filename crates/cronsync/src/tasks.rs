//! Built-in tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use cronsync_scheduler::{JobType, Task, TaskError, TaskRegistry, TimingMiddleware, TracingMiddleware};

/// Job type of [`LogTask`].
pub const LOG_TASK: &str = "log";

/// Job type of [`ExecTask`].
pub const EXEC_TASK: &str = "exec";

/// Registry with every built-in task, wrapped in timing and tracing
/// middleware.
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with_task(Arc::new(LogTask))
        .with_task(Arc::new(ExecTask))
        .with_middleware(Arc::new(TimingMiddleware::new()))
        .with_middleware(Arc::new(TracingMiddleware::new()))
}

/// Logs the payload as text.
pub struct LogTask;

#[async_trait]
impl Task for LogTask {
    fn job_type(&self) -> JobType {
        JobType::new(LOG_TASK)
    }

    async fn execute(&self, payload: &[u8]) -> Result<(), TaskError> {
        info!(message = %String::from_utf8_lossy(payload), "log task");
        Ok(())
    }
}

/// Payload of an [`ExecTask`] job.
#[derive(Debug, Deserialize)]
pub struct ExecPayload {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs a program and fails if it exits unsuccessfully.
pub struct ExecTask;

#[async_trait]
impl Task for ExecTask {
    fn job_type(&self) -> JobType {
        JobType::new(EXEC_TASK)
    }

    async fn execute(&self, payload: &[u8]) -> Result<(), TaskError> {
        let payload: ExecPayload = serde_json::from_slice(payload)
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        debug!(program = %payload.program, args = ?payload.args, "spawning process");
        let output = Command::new(&payload.program)
            .args(&payload.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::failed(format!("failed to spawn {}: {}", payload.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskError::failed(format!(
                "{} exited with {}: {}",
                payload.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}
