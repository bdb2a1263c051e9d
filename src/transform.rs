//! Transform plugin contracts, registry and dispatch.
//!
//! Transforms are opaque capabilities owned by dataset teams. The
//! orchestration core never assumes anything about their business logic:
//! it resolves the plugin registered for a dataset, invokes it, and
//! validates the shape of what comes back. Stage A produces an ordered
//! list of output keys; Stage B submits an asynchronous job and reports
//! its status on each poll.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{
    CatalogSnafu, EmptyKeyListSnafu, JobFailedSnafu, MissingJobFieldSnafu, PipelineError,
    TransformError, TransformSnafu, UnknownJobStatusSnafu, UnknownStageATransformSnafu,
    UnknownStageBTransformSnafu,
};
use crate::services::catalog::MetadataCatalog;
use crate::services::storage::ObjectStorage;

/// Invocation context for a Stage A (per-object) transform.
pub struct StageAContext<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub team: &'a str,
    pub dataset: &'a str,
    /// Storage handle for the transform's own object I/O.
    pub storage: &'a ObjectStorage,
    /// Local working directory, cleared after every invocation.
    pub scratch: &'a Path,
}

/// Invocation context for a Stage B (batched) transform.
pub struct StageBContext<'a> {
    pub bucket: &'a str,
    pub keys: &'a [String],
    pub team: &'a str,
    pub dataset: &'a str,
    pub storage: &'a ObjectStorage,
    pub scratch: &'a Path,
}

/// Per-object light transform capability.
#[async_trait]
pub trait StageATransform: Send + Sync {
    /// Transform one landed object, returning the keys it produced.
    async fn transform_object(&self, ctx: &StageAContext<'_>)
    -> Result<Vec<String>, TransformError>;
}

/// Batched heavy transform capability with asynchronous job semantics.
///
/// `start_job` submits work and returns immediately; `check_job` reports
/// the current status and is re-invoked by an external scheduler until the
/// job is terminal. Both return the job response as loosely shaped JSON —
/// `jobDetails` is opaque to the core beyond its `jobStatus` field.
#[async_trait]
pub trait StageBTransform: Send + Sync {
    async fn start_job(&self, ctx: &StageBContext<'_>) -> Result<Value, TransformError>;

    async fn check_job(
        &self,
        ctx: &StageBContext<'_>,
        job: &JobRun,
    ) -> Result<Value, TransformError>;
}

/// Status of an asynchronous Stage B job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    fn parse(status: &str) -> Result<Self, TransformError> {
        match status {
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => UnknownJobStatusSnafu { status: other }.fail(),
        }
    }
}

/// A validated Stage B job response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    /// Prefix under which the job writes its processed keys.
    #[serde(rename = "processedKeysPath")]
    pub processed_keys_path: String,
    /// Current job status, extracted from `jobDetails.jobStatus`.
    #[serde(rename = "jobStatus")]
    pub job_status: JobStatus,
    /// The full opaque job details, passed back verbatim on each poll.
    #[serde(rename = "jobDetails")]
    pub job_details: Value,
}

impl JobRun {
    /// Validate a raw plugin response against the Stage B contract.
    ///
    /// The response must carry a string `processedKeysPath` and an object
    /// `jobDetails` whose `jobStatus` is one of the known states.
    pub fn from_response(response: &Value) -> Result<Self, TransformError> {
        let processed_keys_path = response
            .get("processedKeysPath")
            .and_then(Value::as_str)
            .context(MissingJobFieldSnafu {
                field: "processedKeysPath",
            })?
            .to_string();

        let job_details = response
            .get("jobDetails")
            .filter(|d| d.is_object())
            .context(MissingJobFieldSnafu {
                field: "jobDetails",
            })?;

        let status = job_details
            .get("jobStatus")
            .and_then(Value::as_str)
            .context(MissingJobFieldSnafu {
                field: "jobDetails.jobStatus",
            })?;

        Ok(Self {
            processed_keys_path,
            job_status: JobStatus::parse(status)?,
            job_details: job_details.clone(),
        })
    }
}

/// Registry of transform plugins, populated at process start.
///
/// Lookup failures surface immediately as configuration errors rather
/// than late runtime failures.
#[derive(Default)]
pub struct TransformRegistry {
    stage_a: HashMap<String, Arc<dyn StageATransform>>,
    stage_b: HashMap<String, Arc<dyn StageBTransform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stage_a(&mut self, name: &str, transform: Arc<dyn StageATransform>) {
        self.stage_a.insert(name.to_string(), transform);
    }

    pub fn register_stage_b(&mut self, name: &str, transform: Arc<dyn StageBTransform>) {
        self.stage_b.insert(name.to_string(), transform);
    }

    pub fn stage_a(&self, name: &str) -> Result<Arc<dyn StageATransform>, TransformError> {
        self.stage_a
            .get(name)
            .cloned()
            .context(UnknownStageATransformSnafu { name })
    }

    pub fn stage_b(&self, name: &str) -> Result<Arc<dyn StageBTransform>, TransformError> {
        self.stage_b
            .get(name)
            .cloned()
            .context(UnknownStageBTransformSnafu { name })
    }
}

/// Resolves and invokes the transform configured for a dataset, and
/// enforces the result-shape contract.
pub struct TransformDispatch {
    registry: Arc<TransformRegistry>,
    catalog: Arc<dyn MetadataCatalog>,
}

impl TransformDispatch {
    pub fn new(registry: Arc<TransformRegistry>, catalog: Arc<dyn MetadataCatalog>) -> Self {
        Self { registry, catalog }
    }

    /// Apply the Stage A transform configured for the dataset.
    pub async fn stage_a_transform(
        &self,
        ctx: &StageAContext<'_>,
    ) -> Result<Vec<String>, PipelineError> {
        let mapping = self
            .catalog
            .transform_mapping(ctx.team, ctx.dataset)
            .await
            .context(CatalogSnafu)?;
        let transform = self
            .registry
            .stage_a(&mapping.stage_a_transform)
            .context(TransformSnafu)?;

        debug!(
            transform = mapping.stage_a_transform,
            key = ctx.key,
            "Dispatching Stage A transform"
        );
        let keys = transform
            .transform_object(ctx)
            .await
            .context(TransformSnafu)?;
        if keys.is_empty() {
            return EmptyKeyListSnafu.fail().context(TransformSnafu);
        }
        Ok(keys)
    }

    /// Submit the Stage B job configured for the dataset.
    pub async fn stage_b_transform(
        &self,
        ctx: &StageBContext<'_>,
    ) -> Result<JobRun, PipelineError> {
        let mapping = self
            .catalog
            .transform_mapping(ctx.team, ctx.dataset)
            .await
            .context(CatalogSnafu)?;
        let transform = self
            .registry
            .stage_b(&mapping.stage_b_transform)
            .context(TransformSnafu)?;

        debug!(
            transform = mapping.stage_b_transform,
            keys = ctx.keys.len(),
            "Dispatching Stage B transform"
        );
        let response = transform.start_job(ctx).await.context(TransformSnafu)?;
        JobRun::from_response(&response).context(TransformSnafu)
    }

    /// Check the status of a previously submitted Stage B job.
    ///
    /// A FAILED terminal status is raised as an error.
    pub async fn stage_b_job_status(
        &self,
        ctx: &StageBContext<'_>,
        job: &JobRun,
    ) -> Result<JobRun, PipelineError> {
        let mapping = self
            .catalog
            .transform_mapping(ctx.team, ctx.dataset)
            .await
            .context(CatalogSnafu)?;
        let transform = self
            .registry
            .stage_b(&mapping.stage_b_transform)
            .context(TransformSnafu)?;

        let response = transform.check_job(ctx, job).await.context(TransformSnafu)?;
        let checked = JobRun::from_response(&response).context(TransformSnafu)?;
        if checked.job_status == JobStatus::Failed {
            return JobFailedSnafu {
                message: format!(
                    "job for '{}-{}' reported FAILED: {}",
                    ctx.team, ctx.dataset, checked.job_details
                ),
            }
            .fail()
            .context(TransformSnafu);
        }
        Ok(checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;
    use crate::services::catalog::MemoryCatalog;
    use serde_json::json;

    struct StaticStageA {
        keys: Vec<String>,
    }

    #[async_trait]
    impl StageATransform for StaticStageA {
        async fn transform_object(
            &self,
            _ctx: &StageAContext<'_>,
        ) -> Result<Vec<String>, TransformError> {
            Ok(self.keys.clone())
        }
    }

    struct StaticStageB {
        response: Value,
    }

    #[async_trait]
    impl StageBTransform for StaticStageB {
        async fn start_job(&self, _ctx: &StageBContext<'_>) -> Result<Value, TransformError> {
            Ok(self.response.clone())
        }

        async fn check_job(
            &self,
            _ctx: &StageBContext<'_>,
            _job: &JobRun,
        ) -> Result<Value, TransformError> {
            Ok(self.response.clone())
        }
    }

    async fn dispatch_with(
        stage_a_keys: Vec<String>,
        stage_b_response: Value,
    ) -> (TransformDispatch, ObjectStorage) {
        let catalog = Arc::new(
            MemoryCatalog::from_datasets(&[DatasetConfig {
                team: "engineering".to_string(),
                dataset: "meteorites".to_string(),
                pipeline: "main".to_string(),
                min_items_process: 1,
                max_items_process: 10,
                stage_a_transform: "light".to_string(),
                stage_b_transform: "heavy".to_string(),
            }])
            .await,
        );
        let mut registry = TransformRegistry::new();
        registry.register_stage_a("light", Arc::new(StaticStageA { keys: stage_a_keys }));
        registry.register_stage_b(
            "heavy",
            Arc::new(StaticStageB {
                response: stage_b_response,
            }),
        );
        (
            TransformDispatch::new(Arc::new(registry), catalog),
            ObjectStorage::memory(),
        )
    }

    #[tokio::test]
    async fn test_stage_a_empty_result_is_contract_violation() {
        let (dispatch, storage) = dispatch_with(vec![], json!({})).await;
        let scratch = std::env::temp_dir();
        let ctx = StageAContext {
            bucket: "raw",
            key: "engineering/meteorites/2026/landing.json",
            team: "engineering",
            dataset: "meteorites",
            storage: &storage,
            scratch: &scratch,
        };

        let err = dispatch.stage_a_transform(&ctx).await.unwrap_err();
        assert!(err.is_invalid_transform_result());
    }

    #[tokio::test]
    async fn test_stage_a_unknown_dataset_is_config_error() {
        let (dispatch, storage) = dispatch_with(vec!["out".to_string()], json!({})).await;
        let scratch = std::env::temp_dir();
        let ctx = StageAContext {
            bucket: "raw",
            key: "x/y/z",
            team: "engineering",
            dataset: "unregistered",
            storage: &storage,
            scratch: &scratch,
        };

        let err = dispatch.stage_a_transform(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Catalog { .. }));
    }

    #[tokio::test]
    async fn test_unmapped_plugin_name_surfaces_at_lookup() {
        // Mapping exists but no plugin was registered under its name
        let catalog = Arc::new(
            MemoryCatalog::from_datasets(&[DatasetConfig {
                team: "engineering".to_string(),
                dataset: "meteorites".to_string(),
                pipeline: "main".to_string(),
                min_items_process: 1,
                max_items_process: 10,
                stage_a_transform: "not_registered".to_string(),
                stage_b_transform: "also_missing".to_string(),
            }])
            .await,
        );
        let dispatch = TransformDispatch::new(Arc::new(TransformRegistry::new()), catalog);
        let storage = ObjectStorage::memory();
        let scratch = std::env::temp_dir();
        let ctx = StageAContext {
            bucket: "raw",
            key: "engineering/meteorites/2026/file.json",
            team: "engineering",
            dataset: "meteorites",
            storage: &storage,
            scratch: &scratch,
        };

        let err = dispatch.stage_a_transform(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transform {
                source: TransformError::UnknownStageATransform { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_stage_b_missing_fields_rejected() {
        for response in [
            json!({"jobDetails": {"jobStatus": "RUNNING"}}),
            json!({"processedKeysPath": "post-stage/x"}),
            json!({"processedKeysPath": "post-stage/x", "jobDetails": {}}),
        ] {
            let (dispatch, storage) = dispatch_with(vec![], response).await;
            let scratch = std::env::temp_dir();
            let keys = vec!["k1".to_string()];
            let ctx = StageBContext {
                bucket: "stage",
                keys: &keys,
                team: "engineering",
                dataset: "meteorites",
                storage: &storage,
                scratch: &scratch,
            };
            let err = dispatch.stage_b_transform(&ctx).await.unwrap_err();
            assert!(err.is_invalid_transform_result());
        }
    }

    #[tokio::test]
    async fn test_stage_b_unknown_status_rejected() {
        let response = json!({
            "processedKeysPath": "post-stage/x",
            "jobDetails": {"jobStatus": "MAYBE"}
        });
        let (dispatch, storage) = dispatch_with(vec![], response).await;
        let scratch = std::env::temp_dir();
        let keys = vec!["k1".to_string()];
        let ctx = StageBContext {
            bucket: "stage",
            keys: &keys,
            team: "engineering",
            dataset: "meteorites",
            storage: &storage,
            scratch: &scratch,
        };

        let err = dispatch.stage_b_transform(&ctx).await.unwrap_err();
        assert!(err.is_invalid_transform_result());
    }

    #[tokio::test]
    async fn test_stage_b_failed_status_raises() {
        let response = json!({
            "processedKeysPath": "post-stage/x",
            "jobDetails": {"jobStatus": "FAILED", "jobRunId": "jr-1"}
        });
        let (dispatch, storage) = dispatch_with(vec![], response.clone()).await;
        let scratch = std::env::temp_dir();
        let keys = vec!["k1".to_string()];
        let ctx = StageBContext {
            bucket: "stage",
            keys: &keys,
            team: "engineering",
            dataset: "meteorites",
            storage: &storage,
            scratch: &scratch,
        };

        let job = JobRun::from_response(&json!({
            "processedKeysPath": "post-stage/x",
            "jobDetails": {"jobStatus": "RUNNING"}
        }))
        .unwrap();
        let err = dispatch.stage_b_job_status(&ctx, &job).await.unwrap_err();
        assert!(err.is_job_failed());
    }

    #[test]
    fn test_job_run_keeps_details_opaque() {
        let job = JobRun::from_response(&json!({
            "processedKeysPath": "post-stage/engineering/meteorites",
            "jobDetails": {"jobStatus": "RUNNING", "jobRunId": "jr-42", "attempt": 3}
        }))
        .unwrap();

        assert_eq!(job.job_status, JobStatus::Running);
        assert_eq!(job.processed_keys_path, "post-stage/engineering/meteorites");
        assert_eq!(job.job_details["jobRunId"], "jr-42");
        assert_eq!(job.job_details["attempt"], 3);
    }
}
