//! Fakes shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::engine::parse_schedule;
use crate::{
    Catalog, CatalogError, CronDefinition, Engine, EngineError, JobDefinition, JobListener,
    JobOptions, JobType, LiveJob, MemoryCatalog, ResolvedTask, Resolver, Task, TaskError,
    TaskRegistry,
};

// =============================================================================
// Tasks
// =============================================================================

/// Task that counts its runs and remembers the last payload.
pub struct CountingTask {
    job_type: JobType,
    runs: AtomicUsize,
    last_payload: Mutex<Option<Vec<u8>>>,
    delay: Option<Duration>,
}

impl CountingTask {
    pub fn new(job_type: &str) -> Self {
        Self {
            job_type: JobType::new(job_type),
            runs: AtomicUsize::new(0),
            last_payload: Mutex::new(None),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<Vec<u8>> {
        self.last_payload.lock().unwrap().clone()
    }
}

#[async_trait]
impl Task for CountingTask {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn execute(&self, payload: &[u8]) -> Result<(), TaskError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        *self.last_payload.lock().unwrap() = Some(payload.to_vec());
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingTask {
    job_type: JobType,
    message: String,
}

#[async_trait]
impl Task for FailingTask {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn execute(&self, _payload: &[u8]) -> Result<(), TaskError> {
        Err(TaskError::failed(self.message.clone()))
    }
}

/// Task that always fails with `message`.
pub fn failing_task(job_type: &str, message: &str) -> Arc<dyn Task> {
    Arc::new(FailingTask {
        job_type: JobType::new(job_type),
        message: message.to_string(),
    })
}

/// Task that blocks every run until [`GatedTask::open`] is called.
pub struct GatedTask {
    job_type: JobType,
    gate: watch::Sender<bool>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl GatedTask {
    pub fn new(job_type: &str) -> Self {
        Self {
            job_type: JobType::new(job_type),
            gate: watch::channel(false).0,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub async fn wait_started(&self, runs: usize) {
        while self.started.load(Ordering::SeqCst) < runs {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for GatedTask {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn execute(&self, _payload: &[u8]) -> Result<(), TaskError> {
        let mut gate = self.gate.subscribe();
        self.started.fetch_add(1, Ordering::SeqCst);
        let _ = gate.wait_for(|open| *open).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry with a [`CountingTask`] for each type.
pub fn registry(job_types: &[&str]) -> Arc<TaskRegistry> {
    Arc::new(TaskRegistry::from_tasks(
        job_types
            .iter()
            .map(|t| Arc::new(CountingTask::new(t)) as Arc<dyn Task>),
    ))
}

/// Resolve `job` against a registry holding only `task`.
pub fn resolve(job: &JobDefinition, task: Arc<dyn Task>) -> ResolvedTask {
    TaskRegistry::from_tasks([task]).resolve(job).unwrap()
}

// =============================================================================
// Listener
// =============================================================================

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobListener for RecordingListener {
    fn on_job_start(&self, job: &LiveJob) {
        self.events.lock().unwrap().push(format!("start:{}", job.name));
    }

    fn on_job_stop(&self, job: &LiveJob) {
        self.events.lock().unwrap().push(format!("stop:{}", job.name));
    }

    fn on_job_error(&self, job: &LiveJob, _error: &TaskError) {
        self.events.lock().unwrap().push(format!("error:{}", job.name));
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A mutation or lifecycle call seen by [`RecordingEngine`], keyed by job name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String),
    Update(String),
    Remove(String),
    Start,
    StopJobs,
    Shutdown,
}

struct FakeJob {
    live: LiveJob,
    cron: CronDefinition,
    last_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FakeState {
    jobs: BTreeMap<Uuid, FakeJob>,
    calls: Vec<Call>,
    failing_names: HashSet<String>,
    failing_last_run: HashSet<Uuid>,
}

/// Engine that only records what it is asked to do.
#[derive(Default)]
pub struct RecordingEngine {
    state: Mutex<FakeState>,
}

impl RecordingEngine {
    /// Register a live job without recording a call.
    pub fn seed(&self, name: &str, last_run: Option<DateTime<Utc>>) -> LiveJob {
        let live = LiveJob {
            id: Uuid::new_v4(),
            name: name.to_string(),
            tags: Vec::new(),
        };
        self.state.lock().unwrap().jobs.insert(
            live.id,
            FakeJob {
                live: live.clone(),
                cron: CronDefinition::from_crontab("0 * * * *"),
                last_run,
            },
        );
        live
    }

    pub fn mark_all_ran(&self, at: DateTime<Utc>) {
        for job in self.state.lock().unwrap().jobs.values_mut() {
            job.last_run = Some(at);
        }
    }

    /// Make `last_run` fail for `id`.
    pub fn fail_last_run(&self, id: Uuid) {
        self.state.lock().unwrap().failing_last_run.insert(id);
    }

    /// Make add, update and remove fail for jobs named `name`.
    pub fn fail_mutations_for(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_names
            .insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .map(|job| job.live.name.clone())
            .collect()
    }

    pub fn cron_for(&self, name: &str) -> Option<CronDefinition> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|job| job.live.name == name)
            .map(|job| job.cron.clone())
    }

    fn rejected(name: &str) -> EngineError {
        EngineError::InvalidCron {
            expression: String::new(),
            reason: format!("rejected {}", name),
        }
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn jobs(&self) -> Vec<LiveJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .map(|job| job.live.clone())
            .collect()
    }

    async fn last_run(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, EngineError> {
        let state = self.state.lock().unwrap();
        if state.failing_last_run.contains(&id) {
            return Err(EngineError::JobNotFound(id));
        }
        state
            .jobs
            .get(&id)
            .map(|job| job.last_run)
            .ok_or(EngineError::JobNotFound(id))
    }

    async fn add_job(
        &self,
        definition: CronDefinition,
        _task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError> {
        parse_schedule(&definition)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_names.contains(&options.name) {
            return Err(Self::rejected(&options.name));
        }

        let live = LiveJob {
            id: Uuid::new_v4(),
            name: options.name,
            tags: options.tags,
        };
        state.calls.push(Call::Add(live.name.clone()));
        state.jobs.insert(
            live.id,
            FakeJob {
                live: live.clone(),
                cron: definition,
                last_run: None,
            },
        );
        Ok(live)
    }

    async fn update_job(
        &self,
        id: Uuid,
        definition: CronDefinition,
        _task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError> {
        parse_schedule(&definition)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_names.contains(&options.name) {
            return Err(Self::rejected(&options.name));
        }

        let job = state.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        job.live.name = options.name;
        job.live.tags = options.tags;
        job.cron = definition;
        job.last_run = None;
        let live = job.live.clone();
        state.calls.push(Call::Update(live.name.clone()));
        Ok(live)
    }

    async fn remove_job(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .jobs
            .get(&id)
            .map(|job| job.live.name.clone())
            .ok_or(EngineError::JobNotFound(id))?;
        if state.failing_names.contains(&name) {
            return Err(Self::rejected(&name));
        }

        state.jobs.remove(&id);
        state.calls.push(Call::Remove(name));
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.state.lock().unwrap().calls.push(Call::Start);
        Ok(())
    }

    async fn stop_jobs(&self) -> Result<(), EngineError> {
        self.state.lock().unwrap().calls.push(Call::StopJobs);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.state.lock().unwrap().calls.push(Call::Shutdown);
        Ok(())
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Catalog over a fixed list that records requested offsets and can fail,
/// block or report cancellation from a given offset on.
pub struct ScriptedCatalog {
    inner: MemoryCatalog,
    offsets: Mutex<Vec<usize>>,
    requested: watch::Sender<usize>,
    fail_from: Option<usize>,
    block_from: Option<usize>,
    cancel_from: Option<usize>,
}

impl ScriptedCatalog {
    /// Jobs are served in list order.
    pub fn new(jobs: Vec<JobDefinition>) -> Self {
        let base = Utc::now();
        let jobs = jobs.into_iter().enumerate().map(|(i, job)| JobDefinition {
            created: base + chrono::Duration::milliseconds(i as i64),
            ..job
        });

        Self {
            inner: MemoryCatalog::with_jobs(jobs),
            offsets: Mutex::new(Vec::new()),
            requested: watch::channel(0).0,
            fail_from: None,
            block_from: None,
            cancel_from: None,
        }
    }

    pub fn fail_from(mut self, offset: usize) -> Self {
        self.fail_from = Some(offset);
        self
    }

    pub fn block_from(mut self, offset: usize) -> Self {
        self.block_from = Some(offset);
        self
    }

    pub fn cancel_from(mut self, offset: usize) -> Self {
        self.cancel_from = Some(offset);
        self
    }

    pub fn offsets(&self) -> Vec<usize> {
        self.offsets.lock().unwrap().clone()
    }

    /// Wait until at least one page has been requested.
    pub async fn wait_for_request(&self) {
        let mut requested = self.requested.subscribe();
        let _ = requested.wait_for(|n| *n > 0).await;
    }
}

#[async_trait]
impl Catalog for ScriptedCatalog {
    async fn find_enabled(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Vec<JobDefinition>, CatalogError> {
        self.offsets.lock().unwrap().push(offset);
        self.requested.send_modify(|n| *n += 1);

        if self.block_from.is_some_and(|from| offset >= from) {
            std::future::pending::<()>().await;
        }
        if self.cancel_from.is_some_and(|from| offset >= from) {
            return Err(CatalogError::Cancelled);
        }
        if self.fail_from.is_some_and(|from| offset >= from) {
            return Err(CatalogError::Unavailable("connection reset".to_string()));
        }
        self.inner.find_enabled(offset, size).await
    }
}
