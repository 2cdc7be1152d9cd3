//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag every registered job carries, ahead of its identity and type.
pub const JOB_TAG: &str = "job";

/// Identifier selecting the task that executes a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    /// Create a job type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for JobType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A job as declared in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Stable identity, the join key between catalog and live scheduler.
    pub id: Uuid,
    /// Which task runs this job.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Cron expression, five fields or six with seconds.
    pub crontab: String,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Opaque payload handed to the task.
    ///
    /// In JSON this is any embedded JSON value, kept as its raw bytes.
    #[serde(default, with = "raw_payload", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    /// Disabled jobs are not scheduled.
    #[serde(default)]
    pub enabled: bool,
    /// When the job was created.
    pub created: DateTime<Utc>,
    /// When the definition last changed.
    pub updated: DateTime<Utc>,
}

impl JobDefinition {
    /// Create an enabled job with a fresh identity.
    pub fn new(job_type: impl Into<JobType>, crontab: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            crontab: crontab.into(),
            tags: Vec::new(),
            payload: Vec::new(),
            enabled: true,
            created: now,
            updated: now,
        }
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Name the job is registered under in the engine.
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    /// Tags the job is registered with: `job`, identity, type, then its own.
    pub fn scheduler_tags(&self) -> Vec<String> {
        let mut tags = Vec::with_capacity(3 + self.tags.len());
        tags.push(JOB_TAG.to_string());
        tags.push(self.id.to_string());
        tags.push(self.job_type.to_string());
        tags.extend(self.tags.iter().cloned());
        tags
    }
}

/// Cron expression with its resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronDefinition {
    expression: String,
    with_seconds: bool,
}

impl CronDefinition {
    /// Build a definition from crontab text.
    ///
    /// Seconds resolution is selected when the text has exactly five spaces
    /// (six fields). Anything else is read as a standard five-field crontab.
    pub fn from_crontab(crontab: &str) -> Self {
        Self {
            expression: crontab.to_string(),
            with_seconds: crontab.matches(' ').count() == 5,
        }
    }

    /// The crontab text as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the first field is seconds.
    pub fn with_seconds(&self) -> bool {
        self.with_seconds
    }
}

impl fmt::Display for CronDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Options a job is registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Job name, the catalog identity as a string.
    pub name: String,
    /// Tags attached to the registration.
    pub tags: Vec<String>,
}

impl JobOptions {
    /// Options for registering `job`.
    pub fn for_job(job: &JobDefinition) -> Self {
        Self {
            name: job.name(),
            tags: job.scheduler_tags(),
        }
    }
}

/// A job registered in a scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveJob {
    /// Engine identifier, distinct from the name.
    pub id: Uuid,
    /// Registration name (catalog identity).
    pub name: String,
    /// Registration tags.
    pub tags: Vec<String>,
}

/// Serde adapter keeping an embedded JSON value as raw bytes.
mod raw_payload {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => value.serialize(serializer),
            // Not JSON: keep the bytes readable as a string
            Err(_) => String::from_utf8_lossy(payload).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(&value).map_err(serde::de::Error::custom)
    }
}
