//! Stage B: batch accumulation, job submission and status polling.
//!
//! The batch accumulator drains a bounded window of keys from a dataset's
//! post-stage queue and hands them to the Stage B workflow. The
//! orchestrator submits the heavy transform as an asynchronous job and is
//! then re-invoked by the external workflow's wait/retry loop until the
//! job reaches a terminal state; it never sleeps or polls internally, so
//! long-running jobs hold no compute here.

use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::NamingConfig;
use crate::emit;
use crate::error::{
    CatalogSnafu, CrawlerSnafu, DownstreamTriggerSnafu, JobFailedSnafu, PayloadSerializeSnafu,
    PehSnafu, PipelineError, PipelineStorageSnafu, QueueSnafu,
};
use crate::metrics::events::{
    BatchKeysDeduplicated, BatchTriggered, CatalogUpserts, StageBExecution, StageOutcome,
};
use crate::peh::{PehClient, PehSession};
use crate::pipeline::stage_a::clear_scratch;
use crate::services::catalog::{MetadataCatalog, ObjectRecord, ObjectStage};
use crate::services::crawler::SchemaCrawler;
use crate::services::queue::OrderedQueue;
use crate::services::storage::ObjectStorage;
use crate::services::workflow::WorkflowClient;
use crate::transform::{JobRun, JobStatus, StageBContext, TransformDispatch};

/// Input to a Stage B submission: one deduplicated batch of keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBInput {
    pub bucket: String,
    #[serde(rename = "keysToProcess")]
    pub keys_to_process: Vec<String>,
    pub team: String,
    pub pipeline: String,
    pub dataset: String,
}

/// A submitted Stage B job, carried between poller invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBJob {
    pub peh_id: String,
    pub bucket: String,
    #[serde(rename = "keysToProcess")]
    pub keys_to_process: Vec<String>,
    pub team: String,
    pub pipeline: String,
    pub dataset: String,
    pub job: JobRun,
}

/// Outcome of one poller invocation.
#[derive(Debug)]
pub enum PollOutcome {
    /// The job is still running; call again later with the updated job.
    Running(StageBJob),
    /// The job succeeded; metadata is cataloged and the crawl triggered.
    Completed { processed_keys: Vec<String> },
}

/// Drains bounded batches from post-stage queues and triggers Stage B
/// workflow executions.
pub struct BatchAccumulator {
    catalog: Arc<dyn MetadataCatalog>,
    queue: Arc<dyn OrderedQueue>,
    workflow: Arc<dyn WorkflowClient>,
    naming: NamingConfig,
    stage_bucket: String,
}

impl BatchAccumulator {
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        queue: Arc<dyn OrderedQueue>,
        workflow: Arc<dyn WorkflowClient>,
        naming: NamingConfig,
        stage_bucket: String,
    ) -> Self {
        Self {
            catalog,
            queue,
            workflow,
            naming,
            stage_bucket,
        }
    }

    /// Run one accumulation pass for a dataset.
    ///
    /// Returns the number of keys handed to Stage B, or `None` when fewer
    /// than the dataset's minimum were available (in which case nothing
    /// is consumed). If the workflow trigger fails after keys were
    /// drained, every drained key is redirected to the dead-letter path
    /// rather than dropped.
    pub async fn run(
        &self,
        team: &str,
        pipeline: &str,
        dataset: &str,
    ) -> Result<Option<usize>, PipelineError> {
        let mapping = self
            .catalog
            .transform_mapping(team, dataset)
            .await
            .context(CatalogSnafu)?;

        info!(team, dataset, "Querying objects waiting for processing");
        let queue_name = self.naming.stage_b_queue(team, dataset);
        let drained = self
            .queue
            .receive_min_max(
                &queue_name,
                mapping.min_items_process,
                mapping.max_items_process,
            )
            .await
            .context(QueueSnafu)?;
        if drained.is_empty() {
            debug!(team, dataset, "Below minimum batch threshold, no action");
            return Ok(None);
        }

        // Duplicate deliveries must not become duplicate work items
        let drained_count = drained.len();
        let keys: Vec<String> = drained.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if keys.len() < drained_count {
            emit!(BatchKeysDeduplicated {
                count: (drained_count - keys.len()) as u64
            });
        }
        info!("{} objects ready for processing", keys.len());

        let payload = json!({
            "statusCode": 200,
            "body": {
                "bucket": &self.stage_bucket,
                "keysToProcess": &keys,
                "team": team,
                "pipeline": pipeline,
                "dataset": dataset,
            }
        });

        let workflow_name = self.naming.stage_b_workflow(team, pipeline);
        info!(workflow = workflow_name, "Starting workflow execution");
        match self.workflow.start_execution(&workflow_name, payload).await {
            Ok(_) => {
                emit!(BatchTriggered {
                    keys: keys.len() as u64
                });
                Ok(Some(keys.len()))
            }
            Err(err) => {
                // The keys are already off the queue; dead-letter each one
                // so a failed trigger never loses them.
                let dlq_name = self.naming.stage_b_dlq(team, dataset);
                error!(
                    workflow = workflow_name,
                    "Workflow trigger failed, redirecting {} keys to {dlq_name}: {err}",
                    keys.len()
                );
                for key in &keys {
                    if let Err(dlq_err) = self
                        .queue
                        .send_message(&dlq_name, key, "failed", &Uuid::new_v4().to_string())
                        .await
                    {
                        error!("Failed to dead-letter key '{key}': {dlq_err}");
                    }
                }
                DownstreamTriggerSnafu {
                    message: err.to_string(),
                }
                .fail()
            }
        }
    }
}

enum Checked {
    Running(JobRun),
    Completed { processed_keys: Vec<String> },
}

/// Orchestrates Stage B job submission and status polling.
pub struct StageBOrchestrator {
    dispatch: Arc<TransformDispatch>,
    catalog: Arc<dyn MetadataCatalog>,
    queue: Arc<dyn OrderedQueue>,
    crawler: Arc<dyn SchemaCrawler>,
    peh: PehClient,
    storage: ObjectStorage,
    naming: NamingConfig,
    scratch_dir: PathBuf,
}

impl StageBOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatch: Arc<TransformDispatch>,
        catalog: Arc<dyn MetadataCatalog>,
        queue: Arc<dyn OrderedQueue>,
        crawler: Arc<dyn SchemaCrawler>,
        peh: PehClient,
        storage: ObjectStorage,
        naming: NamingConfig,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            dispatch,
            catalog,
            queue,
            crawler,
            peh,
            storage,
            naming,
            scratch_dir,
        }
    }

    /// Submit the heavy transform for a batch of keys.
    ///
    /// The returned job carries the execution id; the record stays
    /// Running until a later poll reaches a terminal state.
    pub async fn submit(&self, input: &StageBInput) -> Result<StageBJob, PipelineError> {
        info!(
            team = input.team,
            dataset = input.dataset,
            keys = input.keys_to_process.len(),
            "Stage B submission"
        );

        let comment = serde_json::to_string(input).context(PayloadSerializeSnafu)?;
        let session = self
            .peh
            .start_pipeline_execution(
                &format!("{}-{}-post-stage", input.team, input.pipeline),
                &comment,
            )
            .await
            .context(PehSnafu)?;

        let result = self.start_job(&session, input).await;
        clear_scratch(&self.scratch_dir);

        match result {
            Ok(job) => {
                info!(
                    peh_id = session.id(),
                    path = job.processed_keys_path,
                    "Stage B job submitted"
                );
                Ok(StageBJob {
                    peh_id: session.id().to_string(),
                    bucket: input.bucket.clone(),
                    keys_to_process: input.keys_to_process.clone(),
                    team: input.team.clone(),
                    pipeline: input.pipeline.clone(),
                    dataset: input.dataset.clone(),
                    job,
                })
            }
            Err(err) => {
                let component = "Process";
                let comment = format!("Post-Stage {component} Error: {err}");
                error!(
                    team = input.team,
                    dataset = input.dataset,
                    "Fatal error: {comment}"
                );
                if let Err(peh_err) = session.end_failed(component, &comment).await {
                    error!("Failed to close pipeline execution: {peh_err}");
                }
                emit!(StageBExecution {
                    outcome: StageOutcome::Failed
                });
                Err(err)
            }
        }
    }

    async fn start_job(
        &self,
        session: &PehSession,
        input: &StageBInput,
    ) -> Result<JobRun, PipelineError> {
        session
            .update("Post-Stage Process Processing", "Process")
            .await
            .context(PehSnafu)?;
        let ctx = StageBContext {
            bucket: &input.bucket,
            keys: &input.keys_to_process,
            team: &input.team,
            dataset: &input.dataset,
            storage: &self.storage,
            scratch: &self.scratch_dir,
        };
        self.dispatch.stage_b_transform(&ctx).await
    }

    /// Check a submitted job once.
    ///
    /// RUNNING leaves the execution record open and returns the updated
    /// job for the next invocation. The first SUCCEEDED catalogs every
    /// processed key, triggers exactly one schema crawl, and closes the
    /// record as succeeded. FAILED closes it as failed and re-raises.
    pub async fn poll(&self, job: &StageBJob) -> Result<PollOutcome, PipelineError> {
        let session = self
            .peh
            .retrieve_pipeline_execution(&job.peh_id)
            .await
            .context(PehSnafu)?;

        match self.check(&session, job).await {
            Ok(Checked::Running(checked)) => {
                debug!(peh_id = job.peh_id, "Job still running");
                let mut next = job.clone();
                next.job = checked;
                Ok(PollOutcome::Running(next))
            }
            Ok(Checked::Completed { processed_keys }) => {
                session.end_success().await.context(PehSnafu)?;
                emit!(StageBExecution {
                    outcome: StageOutcome::Success
                });
                info!(
                    keys = processed_keys.len(),
                    "Stage B complete, objects cataloged and crawl triggered"
                );
                Ok(PollOutcome::Completed { processed_keys })
            }
            Err((component, err)) => {
                let comment = format!("Post-Stage {component} Error: {err}");
                error!(
                    team = job.team,
                    dataset = job.dataset,
                    "Fatal error: {comment}"
                );
                if let Err(peh_err) = session.end_failed(component, &comment).await {
                    error!("Failed to close pipeline execution: {peh_err}");
                }
                emit!(StageBExecution {
                    outcome: StageOutcome::Failed
                });
                Err(err)
            }
        }
    }

    async fn check(
        &self,
        session: &PehSession,
        job: &StageBJob,
    ) -> Result<Checked, (&'static str, PipelineError)> {
        let component = "Check";
        session
            .update("Post-Stage Check Processing", component)
            .await
            .context(PehSnafu)
            .map_err(|e| (component, e))?;
        let ctx = StageBContext {
            bucket: &job.bucket,
            keys: &job.keys_to_process,
            team: &job.team,
            dataset: &job.dataset,
            storage: &self.storage,
            scratch: &self.scratch_dir,
        };
        let checked = self
            .dispatch
            .stage_b_job_status(&ctx, &job.job)
            .await
            .map_err(|e| (component, e))?;

        match checked.job_status {
            JobStatus::Running => Ok(Checked::Running(checked)),
            JobStatus::Succeeded => self.finalize(session, job, &checked).await,
            // FAILED is raised by the dispatch layer before we get here
            JobStatus::Failed => Err((
                component,
                PipelineError::Transform {
                    source: JobFailedSnafu {
                        message: format!("job for '{}-{}' reported FAILED", job.team, job.dataset),
                    }
                    .build(),
                },
            )),
        }
    }

    async fn finalize(
        &self,
        session: &PehSession,
        job: &StageBJob,
        checked: &JobRun,
    ) -> Result<Checked, (&'static str, PipelineError)> {
        let component = "Postupdate";
        session
            .update("Post-Stage Postupdate Processing", component)
            .await
            .context(PehSnafu)
            .map_err(|e| (component, e))?;

        let processed_keys = self
            .storage
            .list_keys(&checked.processed_keys_path)
            .await
            .context(PipelineStorageSnafu)
            .map_err(|e| (component, e))?;
        for key in &processed_keys {
            self.catalog
                .upsert_object_record(ObjectRecord {
                    bucket: job.bucket.clone(),
                    key: key.clone(),
                    team: job.team.clone(),
                    pipeline: job.pipeline.clone(),
                    dataset: job.dataset.clone(),
                    stage: ObjectStage::PostStage,
                    peh_id: Some(session.id().to_string()),
                })
                .await
                .context(CatalogSnafu)
                .map_err(|e| (component, e))?;
        }
        emit!(CatalogUpserts {
            count: processed_keys.len() as u64
        });

        let component = "Crawl";
        session
            .update("Post-Stage Crawl Processing", component)
            .await
            .context(PehSnafu)
            .map_err(|e| (component, e))?;
        let crawler_name = self.naming.crawler(&job.team, &job.dataset);
        // An already-running crawl counts as success
        self.crawler
            .start_crawl(&crawler_name)
            .await
            .context(CrawlerSnafu)
            .map_err(|e| (component, e))?;

        Ok(Checked::Completed { processed_keys })
    }

    /// Send a failed execution's original payload to the post-stage
    /// dead-letter queue.
    pub async fn dead_letter(
        &self,
        team: &str,
        dataset: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        let dlq_name = self.naming.stage_b_dlq(team, dataset);
        info!(queue = dlq_name, "Execution failed, sending original payload to DLQ");
        let body = serde_json::to_string(payload).context(PayloadSerializeSnafu)?;
        self.queue
            .send_message(&dlq_name, &body, "failed", &Uuid::new_v4().to_string())
            .await
            .context(QueueSnafu)
    }
}
