//! In-process scheduling engine.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use cronsync_lock::{Lock, Locker};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Engine, JobListener, LogListener};
use crate::config::{DEFAULT_STOP_TIMEOUT, default_limit};
use crate::{CronDefinition, EngineError, JobOptions, LiveJob, ResolvedTask};

/// Parse a cron definition into a schedule with a seconds field.
///
/// Five-field crontabs get a `0` seconds field prepended. The day-of-week
/// field uses crontab numbering (`0` or `7` is Sunday) and is renumbered
/// for the `cron` crate, which counts Sunday as `1`.
pub fn parse_schedule(definition: &CronDefinition) -> Result<Schedule, EngineError> {
    let invalid = |reason: String| EngineError::InvalidCron {
        expression: definition.expression().to_string(),
        reason,
    };

    let mut fields: Vec<String> = definition
        .expression()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if !definition.with_seconds() {
        fields.insert(0, "0".to_string());
    }
    if let Some(day_of_week) = fields.get_mut(5) {
        *day_of_week = crontab_day_of_week(day_of_week).map_err(invalid)?;
    }

    Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a crontab day-of-week field (Sunday = 0) in the `cron` crate's
/// numbering (Sunday = 1).
///
/// Numeric items are expanded into an explicit list so ranges ending in `7`
/// and steps keep their meaning. Named days and `*`/`?` pass through.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    const SUNDAY: u32 = 7;

    let mut items = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) || item == "*" || item == "?" {
            items.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step `{}`", item))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        if step == Some(0) {
            return Err(format!("invalid day-of-week step `{}`", item));
        }

        let day = |value: &str| -> Result<u32, String> {
            value
                .parse::<u32>()
                .ok()
                .filter(|day| *day <= SUNDAY)
                .ok_or_else(|| format!("invalid day of week `{}`", value))
        };
        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (day(first)?, day(last)?),
            None if step.is_some() => (day(range)?, 6),
            None => (day(range)?, day(range)?),
        };
        if first > last {
            return Err(format!("invalid day-of-week range `{}`", item));
        }

        let mut days: Vec<u32> = (first..=last)
            .step_by(step.unwrap_or(1) as usize)
            .map(|day| day % SUNDAY + 1)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|day| day.to_string()));
    }

    Ok(items.join(","))
}

#[derive(Debug, Default)]
struct JobRuntime {
    last_run: StdMutex<Option<DateTime<Utc>>>,
    in_flight: AtomicUsize,
}

impl JobRuntime {
    fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_run(&self, at: Option<DateTime<Utc>>) {
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

struct Registered {
    live: LiveJob,
    schedule: Arc<Schedule>,
    task: ResolvedTask,
    runtime: Arc<JobRuntime>,
    driver: Option<JoinHandle<()>>,
}

impl Registered {
    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    ShutDown,
}

struct State {
    phase: Phase,
    jobs: HashMap<Uuid, Registered>,
}

struct Shared {
    permits: Arc<Semaphore>,
    singleton: bool,
    locker: Option<Arc<dyn Locker>>,
    listener: Arc<dyn JobListener>,
    /// Runs admitted and not yet finished, across all jobs.
    running: watch::Sender<usize>,
}

/// Releases a job's in-flight slot when dropped.
struct Claim {
    shared: Arc<Shared>,
    runtime: Arc<JobRuntime>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.runtime.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Shared {
    fn claim(self: &Arc<Self>, runtime: &Arc<JobRuntime>) -> Option<Claim> {
        if self.singleton {
            runtime
                .in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok()?;
        } else {
            runtime.in_flight.fetch_add(1, Ordering::SeqCst);
        }

        self.running.send_modify(|n| *n += 1);
        Some(Claim {
            shared: Arc::clone(self),
            runtime: Arc::clone(runtime),
        })
    }

    /// Admit and spawn one run of `job`, or skip it until its next fire.
    async fn fire(
        self: &Arc<Self>,
        job: &LiveJob,
        task: &ResolvedTask,
        runtime: &Arc<JobRuntime>,
    ) -> Option<JoinHandle<()>> {
        let Some(claim) = self.claim(runtime) else {
            debug!(job_id = %job.name, "previous run still active, rescheduling");
            return None;
        };

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            debug!(job_id = %job.name, "concurrency limit reached, rescheduling");
            return None;
        };

        let lock = match &self.locker {
            Some(locker) => match locker.lock(&job.name).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    debug!(job_id = %job.name, error = %e, "job lock not obtained, skipping run");
                    return None;
                }
            },
            None => None,
        };

        runtime.set_last_run(Some(Utc::now()));
        Some(tokio::spawn(Self::execute(
            Arc::clone(self),
            job.clone(),
            task.clone(),
            claim,
            permit,
            lock,
        )))
    }

    async fn execute(
        self: Arc<Self>,
        job: LiveJob,
        task: ResolvedTask,
        _claim: Claim,
        _permit: OwnedSemaphorePermit,
        lock: Option<Box<dyn Lock>>,
    ) {
        self.listener.on_job_start(&job);
        match task.run().await {
            Ok(()) => self.listener.on_job_stop(&job),
            Err(e) => self.listener.on_job_error(&job, &e),
        }

        if let Some(lock) = lock {
            if let Err(e) = lock.unlock().await {
                warn!(job_id = %job.name, error = %e, "failed to release job lock");
            }
        }
    }
}

/// Builder for [`LocalEngine`].
pub struct LocalEngineBuilder {
    limit: usize,
    stop_timeout: Duration,
    singleton: bool,
    locker: Option<Arc<dyn Locker>>,
    listener: Arc<dyn JobListener>,
}

impl LocalEngineBuilder {
    /// Maximum number of runs in flight across all jobs. Fires over the
    /// ceiling are skipped.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// How long `stop_jobs` and `shutdown` wait for in-flight runs.
    pub fn stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Skip a fire while the same job's previous run is still active.
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Take a distributed lock, keyed by job name, around every run.
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> LocalEngine {
        let (running, _) = watch::channel(0);
        LocalEngine {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(self.limit)),
                singleton: self.singleton,
                locker: self.locker,
                listener: self.listener,
                running,
            }),
            stop_timeout: self.stop_timeout,
            state: Mutex::new(State {
                phase: Phase::Idle,
                jobs: HashMap::new(),
            }),
        }
    }
}

impl Default for LocalEngineBuilder {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            singleton: true,
            locker: None,
            listener: Arc::new(LogListener),
        }
    }
}

/// Engine that fires jobs from tokio tasks in this process.
///
/// Every registered job gets a driver task while the engine is started. The
/// driver sleeps until the next fire time and then admits the run if
/// singleton mode, the concurrency ceiling and the job lock all allow it.
/// A fire that is not admitted is dropped and the driver waits for the
/// following one.
pub struct LocalEngine {
    shared: Arc<Shared>,
    stop_timeout: Duration,
    state: Mutex<State>,
}

impl LocalEngine {
    /// Engine with default options and no distributed lock.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> LocalEngineBuilder {
        LocalEngineBuilder::default()
    }

    /// Fire the job `id` now, through the same admission checks as a
    /// scheduled fire.
    ///
    /// Returns the handle of the spawned run, or `None` if it was skipped.
    pub async fn run_now(&self, id: Uuid) -> Result<Option<JoinHandle<()>>, EngineError> {
        let (live, task, runtime) = {
            let state = self.state.lock().await;
            if state.phase == Phase::ShutDown {
                return Err(EngineError::ShutDown);
            }
            let job = state.jobs.get(&id).ok_or(EngineError::JobNotFound(id))?;
            (job.live.clone(), job.task.clone(), Arc::clone(&job.runtime))
        };

        Ok(self.shared.fire(&live, &task, &runtime).await)
    }

    fn spawn_driver(&self, job: &Registered) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let live = job.live.clone();
        let schedule = Arc::clone(&job.schedule);
        let task = job.task.clone();
        let runtime = Arc::clone(&job.runtime);

        tokio::spawn(async move {
            let mut cursor = Utc::now();
            while let Some(next) = schedule.after(&cursor).next() {
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep(wait).await;

                shared.fire(&live, &task, &runtime).await;
                // Fires missed while admitting this one are skipped
                cursor = next.max(Utc::now());
            }
            debug!(job_id = %live.name, "schedule has no upcoming fire times");
        })
    }

    async fn wait_idle(&self) -> Result<(), EngineError> {
        let mut running = self.shared.running.subscribe();
        let idle = timeout(self.stop_timeout, running.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if idle {
            return Ok(());
        }

        warn!(
            running = *running.borrow(),
            timeout = ?self.stop_timeout,
            "in-flight jobs did not finish in time"
        );
        Err(EngineError::StopTimeout(self.stop_timeout))
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn jobs(&self) -> Vec<LiveJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().map(|job| job.live.clone()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    async fn last_run(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, EngineError> {
        let state = self.state.lock().await;
        let job = state.jobs.get(&id).ok_or(EngineError::JobNotFound(id))?;
        Ok(job.runtime.last_run())
    }

    async fn add_job(
        &self,
        definition: CronDefinition,
        task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError> {
        let schedule = parse_schedule(&definition)?;

        let mut state = self.state.lock().await;
        if state.phase == Phase::ShutDown {
            return Err(EngineError::ShutDown);
        }

        let live = LiveJob {
            id: Uuid::new_v4(),
            name: options.name,
            tags: options.tags,
        };
        let mut job = Registered {
            live: live.clone(),
            schedule: Arc::new(schedule),
            task,
            runtime: Arc::default(),
            driver: None,
        };
        if state.phase == Phase::Started {
            job.driver = Some(self.spawn_driver(&job));
        }

        debug!(engine_id = %live.id, job_id = %live.name, cron = %definition, "registered job");
        state.jobs.insert(live.id, job);
        Ok(live)
    }

    async fn update_job(
        &self,
        id: Uuid,
        definition: CronDefinition,
        task: ResolvedTask,
        options: JobOptions,
    ) -> Result<LiveJob, EngineError> {
        let schedule = parse_schedule(&definition)?;

        let mut state = self.state.lock().await;
        if state.phase == Phase::ShutDown {
            return Err(EngineError::ShutDown);
        }
        let started = state.phase == Phase::Started;

        let job = state.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        job.stop_driver();
        job.live.name = options.name;
        job.live.tags = options.tags;
        job.schedule = Arc::new(schedule);
        job.task = task;
        // The new definition has not run yet
        job.runtime.set_last_run(None);
        if started {
            job.driver = Some(self.spawn_driver(job));
        }

        debug!(engine_id = %id, job_id = %job.live.name, cron = %definition, "updated job");
        Ok(job.live.clone())
    }

    async fn remove_job(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::ShutDown {
            return Err(EngineError::ShutDown);
        }

        let mut job = state.jobs.remove(&id).ok_or(EngineError::JobNotFound(id))?;
        job.stop_driver();
        debug!(engine_id = %id, job_id = %job.live.name, "removed job");
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::ShutDown => return Err(EngineError::ShutDown),
            Phase::Started => return Ok(()),
            Phase::Idle => {}
        }

        for job in state.jobs.values_mut() {
            job.driver = Some(self.spawn_driver(job));
        }
        state.phase = Phase::Started;
        info!(jobs = state.jobs.len(), "engine started");
        Ok(())
    }

    async fn stop_jobs(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            if state.phase == Phase::ShutDown {
                return Err(EngineError::ShutDown);
            }
            state.jobs.values_mut().for_each(Registered::stop_driver);
            state.phase = Phase::Idle;
        }

        info!("engine stopped, waiting for in-flight jobs");
        self.wait_idle().await
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            if state.phase == Phase::ShutDown {
                return Ok(());
            }
            state.jobs.values_mut().for_each(Registered::stop_driver);
            state.phase = Phase::ShutDown;
        }

        info!("engine shutting down");
        self.wait_idle().await
    }
}

#[cfg(test)]
mod tests {
    use cronsync_lock::{LockPool, LockerConfig, MemoryPool, QuorumLocker};

    use super::*;
    use crate::testing::{CountingTask, GatedTask, RecordingListener, resolve};
    use crate::{JobDefinition, Task};

    fn register(job: &JobDefinition) -> (CronDefinition, JobOptions) {
        (
            CronDefinition::from_crontab(&job.crontab),
            JobOptions::for_job(job),
        )
    }

    async fn add(engine: &LocalEngine, job: &JobDefinition, task: Arc<dyn Task>) -> LiveJob {
        let (definition, options) = register(job);
        engine
            .add_job(definition, resolve(job, task), options)
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_schedule_accepts_five_and_six_fields() {
        assert!(parse_schedule(&CronDefinition::from_crontab("*/15 * * * *")).is_ok());
        assert!(parse_schedule(&CronDefinition::from_crontab("0 6 * * 1-5")).is_ok());
        assert!(parse_schedule(&CronDefinition::from_crontab("*/5 * * * * *")).is_ok());
    }

    fn weekdays(crontab: &str, count: usize) -> Vec<chrono::Weekday> {
        use chrono::{Datelike, TimeZone};

        // A Saturday
        let start = Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap();
        parse_schedule(&CronDefinition::from_crontab(crontab))
            .unwrap()
            .after(&start)
            .take(count)
            .map(|at| at.weekday())
            .collect()
    }

    #[test]
    fn test_parse_schedule_uses_crontab_day_numbering() {
        use chrono::Weekday::*;

        assert_eq!(weekdays("0 6 * * 1-5", 5), vec![Mon, Tue, Wed, Thu, Fri]);
        assert_eq!(weekdays("0 0 * * 0", 2), vec![Sun, Sun]);
        assert_eq!(weekdays("0 0 * * 7", 2), vec![Sun, Sun]);
        assert_eq!(weekdays("0 0 * * 5-7", 4), vec![Sun, Fri, Sat, Sun]);
        assert_eq!(weekdays("0 0 * * 0,6", 3), vec![Sun, Sat, Sun]);
        assert_eq!(weekdays("0 0 * * */2", 4), vec![Sun, Tue, Thu, Sat]);
        assert_eq!(weekdays("0 0 * * 1/3", 3), vec![Mon, Thu, Mon]);
        assert_eq!(weekdays("0 0 * * MON-FRI", 2), vec![Mon, Tue]);
        // Six-field expressions share the same numbering
        assert_eq!(weekdays("0 0 12 * * 3", 1), vec![Wed]);
    }

    #[test]
    fn test_parse_schedule_rejects_bad_day_of_week() {
        for crontab in ["0 0 * * 8", "0 0 * * 5-2", "0 0 * * */0", "0 0 * * x/2"] {
            assert!(
                matches!(
                    parse_schedule(&CronDefinition::from_crontab(crontab)),
                    Err(EngineError::InvalidCron { .. })
                ),
                "{} should be rejected",
                crontab
            );
        }
    }

    #[test]
    fn test_parse_schedule_rejects_garbage() {
        let err = parse_schedule(&CronDefinition::from_crontab("every day")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCron { ref expression, .. } if expression == "every day"));
    }

    #[tokio::test]
    async fn test_add_job_rejects_invalid_cron() {
        let engine = LocalEngine::new();
        let job = JobDefinition::new("report", "61 * * * *");
        let (definition, options) = register(&job);

        let result = engine
            .add_job(definition, resolve(&job, Arc::new(CountingTask::new("report"))), options)
            .await;
        assert!(matches!(result, Err(EngineError::InvalidCron { .. })));
        assert!(engine.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_registered_job_is_listed_with_options() {
        let engine = LocalEngine::new();
        let job = JobDefinition::new("report", "0 * * * *").with_tags(["daily"]);
        let live = add(&engine, &job, Arc::new(CountingTask::new("report"))).await;

        assert_ne!(live.id, job.id);
        assert_eq!(live.name, job.id.to_string());
        assert_eq!(live.tags, job.scheduler_tags());
        assert_eq!(engine.jobs().await, vec![live.clone()]);
        assert_eq!(engine.last_run(live.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let engine = LocalEngine::new();
        let id = Uuid::new_v4();

        assert!(matches!(engine.last_run(id).await, Err(EngineError::JobNotFound(_))));
        assert!(matches!(engine.remove_job(id).await, Err(EngineError::JobNotFound(_))));
        assert!(matches!(engine.run_now(id).await, Err(EngineError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_now_runs_task_and_records_last_run() {
        let listener = Arc::new(RecordingListener::default());
        let engine = LocalEngine::builder()
            .listener(Arc::clone(&listener) as Arc<dyn JobListener>)
            .build();
        let task = Arc::new(CountingTask::new("report"));
        let job = JobDefinition::new("report", "0 * * * *");
        let live = add(&engine, &job, Arc::clone(&task) as Arc<dyn Task>).await;

        let before = Utc::now();
        engine.run_now(live.id).await.unwrap().unwrap().await.unwrap();

        assert_eq!(task.runs(), 1);
        assert!(engine.last_run(live.id).await.unwrap().unwrap() >= before);
        assert_eq!(
            listener.events(),
            vec![format!("start:{}", live.name), format!("stop:{}", live.name)]
        );
    }

    #[tokio::test]
    async fn test_failed_run_reports_error_to_listener() {
        let listener = Arc::new(RecordingListener::default());
        let engine = LocalEngine::builder()
            .listener(Arc::clone(&listener) as Arc<dyn JobListener>)
            .build();
        let job = JobDefinition::new("flaky", "0 * * * *");
        let live = add(&engine, &job, crate::testing::failing_task("flaky", "boom")).await;

        engine.run_now(live.id).await.unwrap().unwrap().await.unwrap();

        assert_eq!(
            listener.events(),
            vec![format!("start:{}", live.name), format!("error:{}", live.name)]
        );
    }

    #[tokio::test]
    async fn test_singleton_skips_overlapping_run() {
        let engine = LocalEngine::new();
        let task = Arc::new(GatedTask::new("slow"));
        let job = JobDefinition::new("slow", "0 * * * *");
        let live = add(&engine, &job, Arc::clone(&task) as Arc<dyn Task>).await;

        let first = engine.run_now(live.id).await.unwrap().unwrap();
        task.wait_started(1).await;
        assert!(engine.run_now(live.id).await.unwrap().is_none());

        task.open();
        first.await.unwrap();
        assert!(engine.run_now(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlap_allowed_without_singleton() {
        let engine = LocalEngine::builder().singleton(false).build();
        let task = Arc::new(GatedTask::new("slow"));
        let job = JobDefinition::new("slow", "0 * * * *");
        let live = add(&engine, &job, Arc::clone(&task) as Arc<dyn Task>).await;

        let first = engine.run_now(live.id).await.unwrap().unwrap();
        let second = engine.run_now(live.id).await.unwrap().unwrap();
        task.wait_started(2).await;

        task.open();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(task.finished(), 2);
    }

    #[tokio::test]
    async fn test_limit_skips_runs_over_ceiling() {
        let engine = LocalEngine::builder().limit(1).build();
        let task = Arc::new(GatedTask::new("slow"));
        let a = add(&engine, &JobDefinition::new("slow", "0 * * * *"), Arc::clone(&task) as Arc<dyn Task>).await;
        let b = add(&engine, &JobDefinition::new("slow", "0 * * * *"), Arc::clone(&task) as Arc<dyn Task>).await;

        let first = engine.run_now(a.id).await.unwrap().unwrap();
        task.wait_started(1).await;
        assert!(engine.run_now(b.id).await.unwrap().is_none());
        // A skipped fire leaves no trace
        assert_eq!(engine.last_run(b.id).await.unwrap(), None);

        task.open();
        first.await.unwrap();
        assert!(engine.run_now(b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_skipped_when_lock_is_held_elsewhere() {
        let pool = Arc::new(MemoryPool::new());
        let config = LockerConfig {
            tries: 1,
            ..LockerConfig::default()
        };
        let locker = QuorumLocker::new(config, vec![Arc::clone(&pool) as Arc<dyn LockPool>]).unwrap();
        let engine = LocalEngine::builder()
            .locker(Arc::new(locker))
            .build();

        let task = Arc::new(CountingTask::new("report"));
        let job = JobDefinition::new("report", "0 * * * *");
        let live = add(&engine, &job, Arc::clone(&task) as Arc<dyn Task>).await;

        // Another instance holds the job
        pool.acquire(&live.name, "other-instance", Duration::from_secs(8))
            .await
            .unwrap();
        assert!(engine.run_now(live.id).await.unwrap().is_none());
        assert_eq!(task.runs(), 0);

        pool.release(&live.name, "other-instance").await.unwrap();
        engine.run_now(live.id).await.unwrap().unwrap().await.unwrap();
        assert_eq!(task.runs(), 1);
        // Released after the run
        assert!(pool.owner(&live.name).is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_clears_last_run() {
        let engine = LocalEngine::new();
        let first = Arc::new(CountingTask::new("report"));
        let second = Arc::new(CountingTask::new("report"));
        let job = JobDefinition::new("report", "0 * * * *");
        let live = add(&engine, &job, Arc::clone(&first) as Arc<dyn Task>).await;

        engine.run_now(live.id).await.unwrap().unwrap().await.unwrap();
        assert!(engine.last_run(live.id).await.unwrap().is_some());

        let changed = JobDefinition {
            crontab: "*/5 * * * * *".to_string(),
            tags: vec!["hot".to_string()],
            ..job
        };
        let (definition, options) = register(&changed);
        let updated = engine
            .update_job(live.id, definition, resolve(&changed, Arc::clone(&second) as Arc<dyn Task>), options)
            .await
            .unwrap();

        assert_eq!(updated.id, live.id);
        assert_eq!(updated.tags, changed.scheduler_tags());
        assert_eq!(engine.last_run(live.id).await.unwrap(), None);

        engine.run_now(live.id).await.unwrap().unwrap().await.unwrap();
        assert_eq!(first.runs(), 1);
        assert_eq!(second.runs(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_registration() {
        let engine = LocalEngine::new();
        let job = JobDefinition::new("report", "0 * * * *");
        let live = add(&engine, &job, Arc::new(CountingTask::new("report"))).await;

        let broken = JobDefinition {
            crontab: "not a cron".to_string(),
            ..job
        };
        let (definition, options) = register(&broken);
        let result = engine
            .update_job(live.id, definition, resolve(&broken, Arc::new(CountingTask::new("report"))), options)
            .await;

        assert!(matches!(result, Err(EngineError::InvalidCron { .. })));
        assert_eq!(engine.jobs().await, vec![live]);
    }

    #[tokio::test]
    async fn test_remove_job() {
        let engine = LocalEngine::new();
        let live = add(&engine, &JobDefinition::new("report", "0 * * * *"), Arc::new(CountingTask::new("report"))).await;

        engine.remove_job(live.id).await.unwrap();
        assert!(engine.jobs().await.is_empty());
        assert!(matches!(engine.last_run(live.id).await, Err(EngineError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_jobs_waits_for_in_flight_runs() {
        let engine = Arc::new(LocalEngine::new());
        let task = Arc::new(GatedTask::new("slow"));
        let live = add(&engine, &JobDefinition::new("slow", "0 * * * *"), Arc::clone(&task) as Arc<dyn Task>).await;

        engine.start().await.unwrap();
        let _run = engine.run_now(live.id).await.unwrap().unwrap();
        task.wait_started(1).await;

        let stopping = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.stop_jobs().await })
        };
        tokio::task::yield_now().await;
        assert!(!stopping.is_finished());

        task.open();
        stopping.await.unwrap().unwrap();
        assert_eq!(task.finished(), 1);
        // Jobs stay registered and the engine can resume
        assert_eq!(engine.jobs().await.len(), 1);
        engine.start().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_jobs_times_out() {
        let engine = LocalEngine::builder()
            .stop_timeout(Duration::from_secs(1))
            .build();
        let task = Arc::new(GatedTask::new("stuck"));
        let live = add(&engine, &JobDefinition::new("stuck", "0 * * * *"), Arc::clone(&task) as Arc<dyn Task>).await;

        let _run = engine.run_now(live.id).await.unwrap().unwrap();
        task.wait_started(1).await;

        assert!(matches!(
            engine.stop_jobs().await,
            Err(EngineError::StopTimeout(d)) if d == Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let engine = LocalEngine::new();
        let job = JobDefinition::new("report", "0 * * * *");
        let live = add(&engine, &job, Arc::new(CountingTask::new("report"))).await;

        engine.start().await.unwrap();
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();

        assert!(matches!(engine.start().await, Err(EngineError::ShutDown)));
        assert!(matches!(engine.stop_jobs().await, Err(EngineError::ShutDown)));
        assert!(matches!(engine.remove_job(live.id).await, Err(EngineError::ShutDown)));
        assert!(matches!(engine.run_now(live.id).await, Err(EngineError::ShutDown)));

        let (definition, options) = register(&job);
        let result = engine
            .add_job(definition, resolve(&job, Arc::new(CountingTask::new("report"))), options)
            .await;
        assert!(matches!(result, Err(EngineError::ShutDown)));
    }

    #[tokio::test]
    async fn test_started_engine_fires_on_schedule() {
        let engine = LocalEngine::new();
        let task = Arc::new(CountingTask::new("tick"));
        let job = JobDefinition::new("tick", "* * * * * *");
        let live = add(&engine, &job, Arc::clone(&task) as Arc<dyn Task>).await;

        engine.start().await.unwrap();
        let fired = timeout(Duration::from_secs(5), async {
            while task.runs() == 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        engine.shutdown().await.unwrap();

        assert!(fired.is_ok(), "job did not fire within 5s");
        assert!(engine.last_run(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stopped_engine_does_not_fire() {
        let engine = LocalEngine::new();
        let task = Arc::new(CountingTask::new("tick"));
        add(&engine, &JobDefinition::new("tick", "* * * * * *"), Arc::clone(&task) as Arc<dyn Task>).await;

        engine.start().await.unwrap();
        engine.stop_jobs().await.unwrap();
        let runs = task.runs();

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(task.runs(), runs);
    }
}
