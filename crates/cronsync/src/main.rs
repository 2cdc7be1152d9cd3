//! cronsync: cron jobs driven by a JSON catalog
//!
//! Main binary with subcommands:
//! - `run`: Keep the scheduler in step with the catalog until Ctrl-C
//! - `check`: Validate every enabled definition in the catalog

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cronsync_lock::LockerConfig;
use cronsync_scheduler::SchedulerConfig;

mod check;
mod daemon;
mod tasks;

#[derive(Parser)]
#[command(name = "cronsync")]
#[command(about = "Cron scheduler reconciled with a job catalog", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Path to the JSON catalog
        #[arg(long, env = "CRONSYNC_CATALOG")]
        catalog: PathBuf,

        #[command(flatten)]
        scheduler: SchedulerArgs,
    },

    /// Validate the catalog without scheduling anything
    Check {
        /// Path to the JSON catalog
        #[arg(long, env = "CRONSYNC_CATALOG")]
        catalog: PathBuf,
    },
}

/// Scheduler and lock tuning. Zero means "use the default".
#[derive(Args, Debug)]
struct SchedulerArgs {
    /// Maximum number of jobs running at once (default: CPU count)
    #[arg(long, env = "CRONSYNC_LIMIT", default_value = "0")]
    limit: usize,

    /// Seconds between catalog reconciliations (minimum 60)
    #[arg(long, env = "CRONSYNC_SYNC_INTERVAL", default_value = "1800")]
    sync_interval: u64,

    /// Seconds to wait for running jobs when stopping
    #[arg(long, env = "CRONSYNC_STOP_TIMEOUT", default_value = "15")]
    stop_timeout: u64,

    /// Lock acquisition attempts
    #[arg(long, env = "CRONSYNC_LOCK_TRIES", default_value = "0")]
    lock_tries: u32,

    /// Clock drift factor applied to the lock expiry
    #[arg(long, env = "CRONSYNC_LOCK_DRIFT_FACTOR", default_value = "0")]
    lock_drift_factor: f64,

    /// Per-pool timeout as a fraction of the lock expiry
    #[arg(long, env = "CRONSYNC_LOCK_TIMEOUT_FACTOR", default_value = "0")]
    lock_timeout_factor: f64,

    /// Lock expiry in milliseconds
    #[arg(long, env = "CRONSYNC_LOCK_EXPIRY_MS", default_value = "0")]
    lock_expiry_ms: u64,

    /// Delay between lock attempts in milliseconds
    #[arg(long, env = "CRONSYNC_LOCK_RETRY_DELAY_MS", default_value = "0")]
    lock_retry_delay_ms: u64,

    /// Fixed lock owner value (empty: random per lock)
    #[arg(long, env = "CRONSYNC_LOCK_VALUE", default_value = "")]
    lock_value: String,

    /// Stop contacting pools once a quorum granted the lock
    #[arg(long, env = "CRONSYNC_LOCK_FAIL_FAST")]
    lock_fail_fast: bool,

    /// Visit lock pools in random order
    #[arg(long, env = "CRONSYNC_LOCK_SHUFFLE_POOLS")]
    lock_shuffle_pools: bool,
}

impl From<SchedulerArgs> for SchedulerConfig {
    fn from(args: SchedulerArgs) -> Self {
        SchedulerConfig {
            limit: args.limit,
            sync: Duration::from_secs(args.sync_interval),
            stop_timeout: Duration::from_secs(args.stop_timeout),
            locker: LockerConfig {
                tries: args.lock_tries,
                drift_factor: args.lock_drift_factor,
                timeout_factor: args.lock_timeout_factor,
                expiry: Duration::from_millis(args.lock_expiry_ms),
                retry_delay: Duration::from_millis(args.lock_retry_delay_ms),
                value: args.lock_value,
                fail_fast: args.lock_fail_fast,
                shuffle_pools: args.lock_shuffle_pools,
            },
        }
        .normalized()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cronsync=info,cronsync_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { catalog, scheduler } => daemon::run(catalog, scheduler.into()).await,
        Commands::Check { catalog } => check::run(&catalog).await,
    }
}
