//! Metadata catalog, transform mapping and dataset registry.
//!
//! The catalog is the key-value store recording the latest known stage of
//! every object flowing through the lake, the per-dataset transform
//! configuration, and which pipeline serves each dataset.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DatasetConfig;
use crate::error::{CatalogError, MappingNotFoundSnafu, PipelineNotFoundSnafu};

/// Processing stage of a cataloged object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectStage {
    Raw,
    PreStage,
    PostStage,
}

impl ObjectStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStage::Raw => "raw",
            ObjectStage::PreStage => "pre-stage",
            ObjectStage::PostStage => "post-stage",
        }
    }
}

/// One object's catalog entry, keyed by (bucket, key).
///
/// Upserts overwrite the previous entry: the catalog reflects only the
/// latest known stage per object, not its full history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub team: String,
    pub pipeline: String,
    pub dataset: String,
    pub stage: ObjectStage,
    /// Execution that last touched this object, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peh_id: Option<String>,
}

/// Per-dataset transform configuration, keyed by "{team}-{dataset}".
///
/// Read-only from the pipeline's perspective; configured out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformMapping {
    pub min_items_process: usize,
    pub max_items_process: usize,
    pub stage_a_transform: String,
    pub stage_b_transform: String,
}

/// Catalog operations used by the pipeline.
///
/// All operations are atomic per key; no multi-key transactions are
/// required. Mappings are resolved on every invocation, never cached.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Idempotently upsert an object record keyed by (bucket, key).
    async fn upsert_object_record(&self, record: ObjectRecord) -> Result<(), CatalogError>;

    /// Resolve the transform mapping for a dataset.
    async fn transform_mapping(
        &self,
        team: &str,
        dataset: &str,
    ) -> Result<TransformMapping, CatalogError>;

    /// Resolve the active pipeline name for a dataset.
    async fn dataset_pipeline(&self, team: &str, dataset: &str) -> Result<String, CatalogError>;
}

/// In-memory catalog used for local runs and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    objects: Mutex<HashMap<(String, String), ObjectRecord>>,
    mappings: Mutex<HashMap<String, TransformMapping>>,
    pipelines: Mutex<HashMap<String, String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog seeded with the datasets from configuration.
    pub async fn from_datasets(datasets: &[DatasetConfig]) -> Self {
        let catalog = Self::new();
        for ds in datasets {
            catalog.register_dataset(ds).await;
        }
        catalog
    }

    /// Register one dataset's pipeline and transform mapping.
    pub async fn register_dataset(&self, ds: &DatasetConfig) {
        let name = format!("{}-{}", ds.team, ds.dataset);
        self.pipelines
            .lock()
            .await
            .insert(name.clone(), ds.pipeline.clone());
        self.mappings.lock().await.insert(
            name,
            TransformMapping {
                min_items_process: ds.min_items_process,
                max_items_process: ds.max_items_process,
                stage_a_transform: ds.stage_a_transform.clone(),
                stage_b_transform: ds.stage_b_transform.clone(),
            },
        );
    }

    /// Look up an object record by (bucket, key).
    pub async fn object_record(&self, bucket: &str, key: &str) -> Option<ObjectRecord> {
        let objects = self.objects.lock().await;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Total number of cataloged objects.
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl MetadataCatalog for MemoryCatalog {
    async fn upsert_object_record(&self, record: ObjectRecord) -> Result<(), CatalogError> {
        debug!(
            bucket = record.bucket,
            key = record.key,
            stage = record.stage.as_str(),
            "Upserting object record"
        );
        let mut objects = self.objects.lock().await;
        objects.insert((record.bucket.clone(), record.key.clone()), record);
        Ok(())
    }

    async fn transform_mapping(
        &self,
        team: &str,
        dataset: &str,
    ) -> Result<TransformMapping, CatalogError> {
        let mappings = self.mappings.lock().await;
        mappings
            .get(&format!("{team}-{dataset}"))
            .cloned()
            .context(MappingNotFoundSnafu { team, dataset })
    }

    async fn dataset_pipeline(&self, team: &str, dataset: &str) -> Result<String, CatalogError> {
        let pipelines = self.pipelines.lock().await;
        pipelines
            .get(&format!("{team}-{dataset}"))
            .cloned()
            .context(PipelineNotFoundSnafu { team, dataset })
    }
}
