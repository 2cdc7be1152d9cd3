//! Run command: keep the scheduler in step with the catalog until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tracing::info;

use cronsync_lock::{LockPool, MemoryPool};
use cronsync_scheduler::{JobSyncer, JsonFileCatalog, LogListener, Scheduler, SchedulerConfig};

use crate::tasks;

pub async fn run(catalog_path: PathBuf, config: SchedulerConfig) -> Result<()> {
    let catalog = Arc::new(JsonFileCatalog::new(catalog_path));
    let registry = Arc::new(tasks::registry());
    let syncer = Arc::new(JobSyncer::new(catalog.clone(), registry));

    info!(
        catalog = %catalog.path().display(),
        limit = config.limit,
        interval = ?config.sync,
        "starting cronsync"
    );

    let pools: Vec<Arc<dyn LockPool>> = vec![Arc::new(MemoryPool::new())];
    let scheduler = Scheduler::new(
        config,
        pools,
        syncer,
        Arc::new(LogListener),
    )
    .map_err(|e| miette::miette!("failed to build scheduler: {}", e))?;

    scheduler
        .start()
        .await
        .map_err(|e| miette::miette!("failed to start scheduler: {}", e))?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal");

    scheduler
        .shutdown()
        .await
        .map_err(|e| miette::miette!("shutdown did not complete cleanly: {}", e))?;

    info!("cronsync stopped");
    Ok(())
}
