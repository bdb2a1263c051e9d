//! Generic polling loop trait and runner.
//!
//! The maintenance duties (batch accumulation, dead-letter redrive) run
//! on a fixed interval; this module provides the shared loop with
//! graceful-shutdown handling.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// Trait for implementing a polling-based processor.
#[async_trait]
pub trait PollingProcessor {
    /// The state type prepared for each iteration.
    type State: Send;
    /// The error type for this processor.
    type Error: std::error::Error + Send;

    /// Prepare state for a processing iteration.
    ///
    /// Returns `None` if there is no work to do.
    async fn prepare(&mut self) -> Result<Option<Self::State>, Self::Error>;

    /// Process the prepared state.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run a polling loop with the given processor.
///
/// Each iteration prepares state, processes it if present, then waits
/// for the poll interval or a shutdown signal.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), P::Error> {
    loop {
        let shutdown_clone = shutdown.clone();
        let state = tokio::select! {
            biased;

            _ = shutdown_clone.cancelled() => {
                info!("Shutdown requested during initialization");
                return Ok(());
            }

            result = processor.prepare() => result?,
        };

        let result = match state {
            Some(s) => processor.process(s).await?,
            None => {
                info!("No items to process");
                IterationResult::NoItems
            }
        };

        match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems | IterationResult::ProcessedItems => {
                info!(
                    "Iteration complete, waiting {}s before next poll",
                    poll_interval.as_secs()
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested during poll wait");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    Ok(())
}
