//! floe: a staged ingestion orchestrator for data lake pipelines.
//!
//! The worker binary runs the periodic maintenance duties against the
//! configured datasets: draining post-stage queues into Stage B workflow
//! executions once their batch window is met, and redriving dead-lettered
//! ingress messages.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use floe::config::Config;
use floe::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use floe::pipeline::{BatchAccumulator, MaintenanceSweep, Redrive, signal};
use floe::poll::run_polling_loop;
use floe::services::catalog::MemoryCatalog;
use floe::services::queue::MemoryQueue;
use floe::metrics;
use floe::services::workflow::MemoryWorkflow;

/// Staged ingestion orchestrator worker.
#[derive(Parser, Debug)]
#[command(name = "floe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("floe starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Stage bucket: {}", config.storage.stage_bucket);
        info!("Layout: {}", config.layout.as_str());
        info!("Datasets: {}", config.datasets.len());
        for ds in &config.datasets {
            info!(
                "  - {}-{} via pipeline '{}' (batch window {}..={})",
                ds.team, ds.dataset, ds.pipeline, ds.min_items_process, ds.max_items_process
            );
        }
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let catalog = Arc::new(MemoryCatalog::from_datasets(&config.datasets).await);
    let queue = Arc::new(MemoryQueue::new());
    let workflow = Arc::new(MemoryWorkflow::new());

    let accumulator = BatchAccumulator::new(
        catalog,
        queue.clone(),
        workflow,
        config.naming.clone(),
        config.storage.stage_bucket.clone(),
    );
    let redrive = Redrive::new(queue);
    let mut sweep = MaintenanceSweep::new(
        accumulator,
        redrive,
        config.naming.clone(),
        config.datasets.clone(),
    );

    let poll_interval = Duration::from_secs(config.maintenance.poll_interval_secs);
    run_polling_loop(&mut sweep, poll_interval, shutdown).await?;

    info!("floe shut down cleanly");
    Ok(())
}
