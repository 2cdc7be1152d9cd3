//! Scheduler facade.
//!
//! Owns the engine and the background reconciliation loop: one tick right
//! after start, then one per sync interval until stopped.

use std::sync::Arc;
use std::time::Duration;

use cronsync_lock::{LockPool, QuorumLocker};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::{
    Engine, JobListener, LocalEngine, SchedulerConfig, SchedulerError, SyncReport, Syncer,
};

/// Lifecycle of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Stopped,
    ShutDown,
}

struct State {
    lifecycle: Lifecycle,
    shutdown_tx: Option<watch::Sender<bool>>,
    sync_handle: Option<JoinHandle<()>>,
}

impl State {
    /// Move to `lifecycle` and hand back the sync loop for cancellation.
    fn enter(&mut self, lifecycle: Lifecycle) -> SyncLoop {
        self.lifecycle = lifecycle;
        SyncLoop {
            shutdown_tx: self.shutdown_tx.take(),
            handle: self.sync_handle.take(),
        }
    }
}

/// A detached sync loop.
struct SyncLoop {
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncLoop {
    /// Cancel the loop and wait for it to exit.
    async fn cancel(self) {
        if let Some(shutdown_tx) = self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

/// Cron scheduler kept in step with a catalog.
pub struct Scheduler {
    engine: Arc<dyn Engine>,
    syncer: Arc<dyn Syncer>,
    sync_interval: Duration,
    /// Held for the duration of a tick so ticks never overlap.
    tick: Arc<Mutex<()>>,
    /// Serializes start, stop and shutdown.
    transition: Mutex<()>,
    /// Only held briefly; never across engine calls.
    state: Mutex<State>,
}

impl Scheduler {
    /// Build a scheduler on a [`LocalEngine`] whose runs are guarded by a
    /// quorum lock over `pools`.
    pub fn new(
        config: SchedulerConfig,
        pools: Vec<Arc<dyn LockPool>>,
        syncer: Arc<dyn Syncer>,
        listener: Arc<dyn JobListener>,
    ) -> Result<Self, SchedulerError> {
        let config = config.normalized();
        let locker = QuorumLocker::new(config.locker.clone(), pools)?;

        let engine = LocalEngine::builder()
            .limit(config.limit)
            .stop_timeout(config.stop_timeout)
            .singleton(true)
            .locker(Arc::new(locker))
            .listener(listener)
            .build();

        Ok(Self::with_engine(Arc::new(engine), syncer, config.sync))
    }

    /// Build a scheduler on any engine. `sync_interval` is used as given.
    pub fn with_engine(
        engine: Arc<dyn Engine>,
        syncer: Arc<dyn Syncer>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            engine,
            syncer,
            sync_interval,
            tick: Arc::new(Mutex::new(())),
            transition: Mutex::new(()),
            state: Mutex::new(State {
                lifecycle: Lifecycle::Created,
                shutdown_tx: None,
                sync_handle: None,
            }),
        }
    }

    /// The engine jobs are registered with.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.lock().await.lifecycle
    }

    /// Whether the sync loop is active.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .sync_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the engine and the sync loop. Does nothing if already started.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let _transition = self.transition.lock().await;
        match self.lifecycle().await {
            Lifecycle::ShutDown => return Err(SchedulerError::ShutDown),
            Lifecycle::Started => return Ok(()),
            Lifecycle::Created | Lifecycle::Stopped => {}
        }

        self.engine.start().await?;

        let mut state = self.state.lock().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        state.sync_handle = Some(tokio::spawn(run_sync_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.syncer),
            Arc::clone(&self.tick),
            self.sync_interval,
            shutdown_rx,
        )));
        state.shutdown_tx = Some(shutdown_tx);
        state.lifecycle = Lifecycle::Started;

        info!(interval = ?self.sync_interval, "scheduler started");
        Ok(())
    }

    /// Stop the sync loop and the engine's jobs. The scheduler can be
    /// started again.
    #[tracing::instrument(skip(self))]
    pub async fn stop_jobs(&self) -> Result<(), SchedulerError> {
        let _transition = self.transition.lock().await;
        let sync_loop = {
            let mut state = self.state.lock().await;
            if state.lifecycle == Lifecycle::ShutDown {
                return Err(SchedulerError::ShutDown);
            }
            state.enter(Lifecycle::Stopped)
        };

        sync_loop.cancel().await;
        self.engine.stop_jobs().await?;

        info!("scheduler stopped");
        Ok(())
    }

    /// Stop everything for good.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let _transition = self.transition.lock().await;
        let sync_loop = {
            let mut state = self.state.lock().await;
            if state.lifecycle == Lifecycle::ShutDown {
                return Err(SchedulerError::ShutDown);
            }
            state.enter(Lifecycle::ShutDown)
        };

        sync_loop.cancel().await;
        self.engine.shutdown().await?;

        info!("scheduler shut down");
        Ok(())
    }

    /// Run one reconciliation tick now.
    pub async fn sync_now(&self) -> Result<SyncReport, SchedulerError> {
        let shutdown_rx = {
            let state = self.state.lock().await;
            if state.lifecycle == Lifecycle::ShutDown {
                return Err(SchedulerError::ShutDown);
            }
            match &state.shutdown_tx {
                Some(shutdown_tx) => shutdown_tx.subscribe(),
                None => watch::channel(false).1,
            }
        };

        let _tick = self.tick.lock().await;
        Ok(self.syncer.sync(self.engine.as_ref(), shutdown_rx).await)
    }
}

async fn run_sync_loop(
    engine: Arc<dyn Engine>,
    syncer: Arc<dyn Syncer>,
    tick: Arc<Mutex<()>>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("sync loop started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = interval.tick() => {
                let _tick = tick.lock().await;
                syncer.sync(engine.as_ref(), shutdown_rx.clone()).await;
            }
        }
    }

    debug!("sync loop stopped");
}
