//! Pipeline orchestration components.
//!
//! The staged ingestion path, leaves first: the router classifies landed
//! objects onto ordered queues, Stage A transforms each object and
//! forwards its outputs, the batch accumulator windows those outputs into
//! Stage B submissions, and the poller drives each submitted job to a
//! terminal state. Redrive is an independent maintenance loop over
//! dead-lettered messages.

pub mod redrive;
pub mod router;
pub mod signal;
pub mod stage_a;
pub mod stage_b;

pub use redrive::Redrive;
pub use router::{ObjectEvent, Route, RoutedMessage, Router, classify};
pub use stage_a::StageAOrchestrator;
pub use stage_b::{BatchAccumulator, PollOutcome, StageBInput, StageBJob, StageBOrchestrator};

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::error;

use crate::config::{DatasetConfig, NamingConfig};
use crate::error::PipelineError;
use crate::poll::{IterationResult, PollingProcessor};

/// Periodic maintenance duties: one accumulation pass per dataset and one
/// redrive pass per ingress dead-letter queue.
pub struct MaintenanceSweep {
    accumulator: BatchAccumulator,
    redrive: Redrive,
    naming: NamingConfig,
    datasets: Vec<DatasetConfig>,
}

impl MaintenanceSweep {
    pub fn new(
        accumulator: BatchAccumulator,
        redrive: Redrive,
        naming: NamingConfig,
        datasets: Vec<DatasetConfig>,
    ) -> Self {
        Self {
            accumulator,
            redrive,
            naming,
            datasets,
        }
    }
}

#[async_trait]
impl PollingProcessor for MaintenanceSweep {
    type State = Vec<DatasetConfig>;
    type Error = PipelineError;

    async fn prepare(&mut self) -> Result<Option<Self::State>, PipelineError> {
        if self.datasets.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.datasets.clone()))
    }

    async fn process(
        &mut self,
        datasets: Vec<DatasetConfig>,
    ) -> Result<IterationResult, PipelineError> {
        // A failing dataset must not starve the rest of the sweep
        for ds in &datasets {
            if let Err(e) = self
                .accumulator
                .run(&ds.team, &ds.pipeline, &ds.dataset)
                .await
            {
                error!(
                    team = ds.team,
                    dataset = ds.dataset,
                    "Accumulator sweep failed: {e}"
                );
            }
        }

        let pipelines: BTreeSet<(String, String)> = datasets
            .iter()
            .map(|ds| (ds.team.clone(), ds.pipeline.clone()))
            .collect();
        for (team, pipeline) in pipelines {
            let dlq_name = self.naming.stage_a_dlq(&team, &pipeline);
            let primary_name = self.naming.stage_a_queue(&team, &pipeline);
            if let Err(e) = self.redrive.run(&dlq_name, &primary_name).await {
                error!(team, pipeline, "Redrive sweep failed: {e}");
            }
        }

        Ok(IterationResult::ProcessedItems)
    }
}
