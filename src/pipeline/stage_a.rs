//! Stage A orchestrator: the per-object light transform path.
//!
//! Drives one routed message through the pre-stage pipeline: dispatches
//! the Stage A transform, catalogs every output key, and forwards the
//! keys to the post-stage queue. The whole run is wrapped in a pipeline
//! execution record that is closed exactly once, on both the success and
//! the error path.

use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::NamingConfig;
use crate::emit;
use crate::error::{CatalogSnafu, PayloadSerializeSnafu, PehSnafu, PipelineError, QueueSnafu};
use crate::metrics::events::{CatalogUpserts, StageAExecution, StageOutcome};
use crate::peh::{PehClient, PehSession};
use crate::pipeline::router::RoutedMessage;
use crate::services::catalog::{MetadataCatalog, ObjectRecord, ObjectStage};
use crate::services::queue::OrderedQueue;
use crate::services::storage::ObjectStorage;
use crate::transform::{StageAContext, TransformDispatch};

/// Orchestrates one Stage A invocation per routed message.
pub struct StageAOrchestrator {
    dispatch: Arc<TransformDispatch>,
    catalog: Arc<dyn MetadataCatalog>,
    queue: Arc<dyn OrderedQueue>,
    peh: PehClient,
    storage: ObjectStorage,
    naming: NamingConfig,
    stage_bucket: String,
    scratch_dir: PathBuf,
}

impl StageAOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatch: Arc<TransformDispatch>,
        catalog: Arc<dyn MetadataCatalog>,
        queue: Arc<dyn OrderedQueue>,
        peh: PehClient,
        storage: ObjectStorage,
        naming: NamingConfig,
        stage_bucket: String,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            dispatch,
            catalog,
            queue,
            peh,
            storage,
            naming,
            stage_bucket,
            scratch_dir,
        }
    }

    /// Run the per-object path for one routed message.
    ///
    /// Returns the keys produced by the transform. On failure the
    /// execution record is closed as failed with a component-tagged
    /// comment and the error is re-raised for the invoking fabric to
    /// retry or dead-letter.
    pub async fn run(&self, message: &RoutedMessage) -> Result<Vec<String>, PipelineError> {
        info!(
            team = message.team,
            dataset = message.dataset,
            key = message.key,
            "Stage A processing"
        );

        let comment = serde_json::to_string(message).context(PayloadSerializeSnafu)?;
        let session = self
            .peh
            .start_pipeline_execution(
                &format!("{}-{}-pre-stage", message.team, message.pipeline),
                &comment,
            )
            .await
            .context(PehSnafu)?;

        let result = self.process(&session, message).await;
        // The execution environment is reused; stale transform output must
        // not leak into the next invocation.
        clear_scratch(&self.scratch_dir);

        match result {
            Ok(keys) => {
                session.end_success().await.context(PehSnafu)?;
                emit!(StageAExecution {
                    outcome: StageOutcome::Success
                });
                info!(
                    keys = keys.len(),
                    "Stage A complete, keys forwarded for post-stage processing"
                );
                Ok(keys)
            }
            Err((component, err)) => {
                let comment = format!("Pre-Stage {component} Error: {err}");
                error!(
                    team = message.team,
                    dataset = message.dataset,
                    key = message.key,
                    "Fatal error: {comment}"
                );
                if let Err(peh_err) = session.end_failed(component, &comment).await {
                    error!("Failed to close pipeline execution: {peh_err}");
                }
                emit!(StageAExecution {
                    outcome: StageOutcome::Failed
                });
                Err(err)
            }
        }
    }

    async fn process(
        &self,
        session: &PehSession,
        message: &RoutedMessage,
    ) -> Result<Vec<String>, (&'static str, PipelineError)> {
        let component = "Process";
        session
            .update("Pre-Stage Process Processing", component)
            .await
            .context(PehSnafu)
            .map_err(|e| (component, e))?;
        let ctx = StageAContext {
            bucket: &message.bucket,
            key: &message.key,
            team: &message.team,
            dataset: &message.dataset,
            storage: &self.storage,
            scratch: &self.scratch_dir,
        };
        let keys = self
            .dispatch
            .stage_a_transform(&ctx)
            .await
            .map_err(|e| (component, e))?;

        let component = "Postupdate";
        session
            .update("Pre-Stage Postupdate Processing", component)
            .await
            .context(PehSnafu)
            .map_err(|e| (component, e))?;
        for key in &keys {
            self.catalog
                .upsert_object_record(ObjectRecord {
                    bucket: self.stage_bucket.clone(),
                    key: key.clone(),
                    team: message.team.clone(),
                    pipeline: message.pipeline.clone(),
                    dataset: message.dataset.clone(),
                    stage: ObjectStage::PreStage,
                    peh_id: Some(session.id().to_string()),
                })
                .await
                .context(CatalogSnafu)
                .map_err(|e| (component, e))?;
        }
        emit!(CatalogUpserts {
            count: keys.len() as u64
        });

        let queue_name = self.naming.stage_b_queue(&message.team, &message.dataset);
        self.queue
            .send_batch(&queue_name, &keys, &message.group())
            .await
            .context(QueueSnafu)
            .map_err(|e| (component, e))?;

        Ok(keys)
    }
}

/// Remove everything under the scratch directory.
///
/// Called after every transform invocation, success or failure. Cleanup
/// problems are logged rather than raised: they must not mask the
/// invocation's own outcome.
pub fn clear_scratch(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Failed to read scratch directory {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!("Failed to clear scratch entry {}: {e}", path.display());
        }
    }
}
