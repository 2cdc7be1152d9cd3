//! Task registry and middleware pipeline.
//!
//! A [`TaskRegistry`] maps job types to [`Task`] handlers. Resolving a
//! [`JobDefinition`] binds its payload to the handler and wraps the call in
//! every registered [`Middleware`], producing a [`ResolvedTask`] the engine
//! can fire as often as the schedule demands.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::{JobDefinition, JobType, ResolveError, TaskError};

/// Future returned by one task invocation.
pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

type Handler = Arc<dyn Fn(Arc<JobDefinition>) -> TaskFuture + Send + Sync>;

/// Executable unit of work for one job type.
#[async_trait]
pub trait Task: Send + Sync {
    /// The job type this task handles.
    fn job_type(&self) -> JobType;

    /// Run the task against a job's payload.
    async fn execute(&self, payload: &[u8]) -> Result<(), TaskError>;
}

/// Continuation handed to a [`Middleware`].
///
/// Consumed by [`Next::run`], so a middleware can reach the rest of the
/// chain at most once per invocation.
pub struct Next {
    handler: Handler,
}

impl Next {
    /// Invoke the remainder of the chain.
    pub fn run(self, job: Arc<JobDefinition>) -> TaskFuture {
        (self.handler)(job)
    }
}

/// Wraps task invocations.
///
/// Implementations may run code around `next` and observe its error, but
/// must call it and return what it returned.
pub trait Middleware: Send + Sync {
    /// Handle one invocation of `job`.
    fn handle(&self, job: Arc<JobDefinition>, next: Next) -> TaskFuture;
}

impl<F> Middleware for F
where
    F: Fn(Arc<JobDefinition>, Next) -> TaskFuture + Send + Sync,
{
    fn handle(&self, job: Arc<JobDefinition>, next: Next) -> TaskFuture {
        self(job, next)
    }
}

/// A task bound to one job definition, wrapped by the middleware chain.
///
/// Cheap to clone; each call to [`ResolvedTask::run`] is an independent
/// invocation.
#[derive(Clone)]
pub struct ResolvedTask {
    job: Arc<JobDefinition>,
    handler: Handler,
}

impl ResolvedTask {
    /// The definition this task was resolved from.
    pub fn job(&self) -> &JobDefinition {
        &self.job
    }

    /// Invoke the task.
    pub fn run(&self) -> TaskFuture {
        (self.handler)(Arc::clone(&self.job))
    }
}

impl fmt::Debug for ResolvedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTask")
            .field("job_id", &self.job.id)
            .field("job_type", &self.job.job_type)
            .finish_non_exhaustive()
    }
}

/// Resolves job definitions into executable tasks.
pub trait Resolver: Send + Sync {
    /// Append a middleware. It applies to tasks resolved from now on.
    fn middleware(&self, middleware: Arc<dyn Middleware>);

    /// Resolve `job` into a task wrapped by the current middleware chain.
    fn resolve(&self, job: &JobDefinition) -> Result<ResolvedTask, ResolveError>;
}

/// Registry of tasks keyed by job type.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<JobType, Arc<dyn Task>>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `tasks`. Later tasks replace earlier ones of the
    /// same type.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Arc<dyn Task>>) -> Self {
        tasks
            .into_iter()
            .fold(Self::new(), |registry, task| registry.with_task(task))
    }

    /// Register `task`, replacing any task of the same type.
    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        let job_type = task.job_type();
        if self.tasks.insert(job_type.clone(), task).is_some() {
            debug!(job_type = %job_type, "replaced task registration");
        }
        self
    }

    /// Append a middleware while building.
    pub fn with_middleware(self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware(middleware);
        self
    }

    /// Whether a task is registered for `job_type`.
    pub fn contains(&self, job_type: &JobType) -> bool {
        self.tasks.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.tasks.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Resolver for TaskRegistry {
    fn middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    fn resolve(&self, job: &JobDefinition) -> Result<ResolvedTask, ResolveError> {
        let task = self
            .tasks
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| ResolveError::TaskNotFound(job.job_type.clone()))?;

        let mut handler: Handler = Arc::new(move |job: Arc<JobDefinition>| {
            let task = Arc::clone(&task);
            Box::pin(async move { task.execute(&job.payload).await }) as TaskFuture
        });

        // Wrap innermost first so the first registered ends up outermost
        let middlewares = self
            .middlewares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for middleware in middlewares.into_iter().rev() {
            let inner = handler;
            handler = Arc::new(move |job: Arc<JobDefinition>| {
                middleware.handle(
                    job,
                    Next {
                        handler: Arc::clone(&inner),
                    },
                )
            });
        }

        Ok(ResolvedTask {
            job: Arc::new(job.clone()),
            handler,
        })
    }
}
