//! Reconciliation of the catalog against a scheduling engine.
//!
//! A tick snapshots the engine's jobs, streams the enabled catalog page by
//! page, adds or updates every definition it sees and finally removes live
//! jobs no definition claimed. Per-job failures are logged and counted; only
//! a catalog read failure aborts the tick, and then nothing is removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    Catalog, CatalogError, CronDefinition, Engine, JobDefinition, JobOptions, LiveJob, Resolver,
    SyncError,
};

/// Number of definitions requested per catalog read.
pub const PAGE_SIZE: usize = 20;

/// How a tick ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The whole catalog was read and the removal pass ran.
    #[default]
    Completed,
    /// A catalog read failed; no jobs were removed.
    Aborted,
    /// The tick was cancelled; no jobs were removed.
    Cancelled,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    /// Live jobs whose update was skipped.
    pub unchanged: usize,
    pub removed: usize,
    /// Resolution or engine failures.
    pub failed: usize,
    pub outcome: SyncOutcome,
}

impl SyncReport {
    /// Number of engine mutations the tick issued successfully.
    pub fn mutations(&self) -> usize {
        self.added + self.updated + self.removed
    }

    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Added => self.added += 1,
            Applied::Updated => self.updated += 1,
            Applied::Unchanged => self.unchanged += 1,
        }
    }
}

/// Runs reconciliation ticks.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Run one tick against `engine`. Sending `true` on the shutdown channel
    /// cancels it.
    async fn sync(&self, engine: &dyn Engine, shutdown_rx: watch::Receiver<bool>) -> SyncReport;
}

enum Applied {
    Added,
    Updated,
    Unchanged,
}

/// Whether a live job should take a definition updated at `updated`.
///
/// Only when it has run and the definition changed strictly after that run.
pub fn should_update(last_run: Option<DateTime<Utc>>, updated: DateTime<Utc>) -> bool {
    matches!(last_run, Some(last_run) if updated > last_run)
}

/// Resolves once the shutdown channel carries `true`.
async fn cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: nobody can cancel any more
        std::future::pending::<()>().await;
    }
}

/// Syncer reading from a [`Catalog`] and resolving through a [`Resolver`].
pub struct JobSyncer {
    catalog: Arc<dyn Catalog>,
    resolver: Arc<dyn Resolver>,
    page_size: usize,
}

impl JobSyncer {
    pub fn new(catalog: Arc<dyn Catalog>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            catalog,
            resolver,
            page_size: PAGE_SIZE,
        }
    }

    /// Override the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn process(
        &self,
        engine: &dyn Engine,
        present: &mut HashMap<String, LiveJob>,
        job: &JobDefinition,
    ) -> Result<Applied, SyncError> {
        let task = self
            .resolver
            .resolve(job)
            .map_err(|source| SyncError::Resolve {
                job_id: job.id,
                source,
            })?;
        let definition = CronDefinition::from_crontab(&job.crontab);
        let options = JobOptions::for_job(job);

        let Some(live) = present.remove(&job.name()) else {
            engine
                .add_job(definition, task, options)
                .await
                .map_err(|source| SyncError::Add {
                    job_id: job.id,
                    source,
                })?;
            debug!(job_id = %job.id, job_type = %job.job_type, "added job");
            return Ok(Applied::Added);
        };

        let last_run = match engine.last_run(live.id).await {
            Ok(last_run) => last_run,
            Err(e) => {
                debug!(job_id = %job.id, engine_id = %live.id, error = %e, "last run unavailable, keeping job");
                return Ok(Applied::Unchanged);
            }
        };
        if !should_update(last_run, job.updated) {
            return Ok(Applied::Unchanged);
        }

        engine
            .update_job(live.id, definition, task, options)
            .await
            .map_err(|source| SyncError::Update {
                job_id: job.id,
                source,
            })?;
        debug!(job_id = %job.id, engine_id = %live.id, "updated job");
        Ok(Applied::Updated)
    }

    async fn remove_unclaimed(
        &self,
        engine: &dyn Engine,
        present: HashMap<String, LiveJob>,
        report: &mut SyncReport,
    ) {
        for (name, live) in present {
            match engine.remove_job(live.id).await {
                Ok(()) => {
                    report.removed += 1;
                    debug!(job_id = %name, engine_id = %live.id, "removed job");
                }
                Err(source) => {
                    report.failed += 1;
                    let e = SyncError::Remove { name, source };
                    error!(error = %e, "failed to remove job");
                }
            }
        }
    }
}

#[async_trait]
impl Syncer for JobSyncer {
    #[tracing::instrument(name = "sync", skip_all)]
    async fn sync(&self, engine: &dyn Engine, mut shutdown_rx: watch::Receiver<bool>) -> SyncReport {
        let mut report = SyncReport::default();
        let mut present: HashMap<String, LiveJob> = engine
            .jobs()
            .await
            .into_iter()
            .map(|live| (live.name.clone(), live))
            .collect();
        let mut seen = HashSet::new();
        let mut offset = 0;

        loop {
            if *shutdown_rx.borrow() {
                report.outcome = SyncOutcome::Cancelled;
                debug!("sync cancelled");
                return report;
            }

            let page = tokio::select! {
                biased;

                _ = cancelled(&mut shutdown_rx) => Err(CatalogError::Cancelled),
                page = self.catalog.find_enabled(offset, self.page_size) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(CatalogError::Cancelled) => {
                    report.outcome = SyncOutcome::Cancelled;
                    debug!("sync cancelled during catalog read");
                    return report;
                }
                Err(_) if *shutdown_rx.borrow() => {
                    report.outcome = SyncOutcome::Cancelled;
                    return report;
                }
                Err(e) => {
                    report.outcome = SyncOutcome::Aborted;
                    error!(offset, error = %e, "failed to read job catalog");
                    return report;
                }
            };

            let fetched = page.len();
            for job in &page {
                if !seen.insert(job.id) {
                    warn!(job_id = %job.id, "job listed twice in one sync, ignoring repeat");
                    continue;
                }

                match self.process(engine, &mut present, job).await {
                    Ok(applied) => report.record(applied),
                    Err(e) => {
                        report.failed += 1;
                        error!(job_id = %job.id, job_type = %job.job_type, error = %e, "failed to sync job");
                    }
                }
            }

            if fetched < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        self.remove_unclaimed(engine, present, &mut report).await;

        info!(
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            "sync finished"
        );
        report
    }
}
