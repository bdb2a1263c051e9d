//! Configuration parsing and resource naming.
//!
//! Handles loading configuration from YAML files with environment variable
//! interpolation, and derives the deterministic names of queues, workflows
//! and crawlers from the naming scheme.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;

use crate::error::{
    ConfigError, EmptyNamingFieldSnafu, EmptyStageBucketSnafu, EnvInterpolationSnafu,
    InvalidBatchWindowSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Main configuration structure for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub naming: NamingConfig,
    /// Path layout used by the router to classify landed objects.
    #[serde(default)]
    pub layout: PathLayout,
    pub storage: StorageConfig,
    /// Datasets managed by this deployment.
    pub datasets: Vec<DatasetConfig>,
    /// Maintenance loop configuration (optional).
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Naming scheme shared by every managed resource.
///
/// Queue, workflow and crawler names are derived from these components so
/// that collaborators can be addressed without any per-resource lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Resource prefix (default: "floe").
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub org: String,
    pub app: String,
    pub env: String,
}

fn default_prefix() -> String {
    "floe".to_string()
}

impl NamingConfig {
    /// Name of the ordered ingress queue for a (team, pipeline).
    pub fn stage_a_queue(&self, team: &str, pipeline: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}-queue-a.fifo",
            self.prefix, team, pipeline, self.org, self.app, self.env
        )
    }

    /// Name of the dead-letter queue paired with the ingress queue.
    pub fn stage_a_dlq(&self, team: &str, pipeline: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}-dlq-a.fifo",
            self.prefix, team, pipeline, self.org, self.app, self.env
        )
    }

    /// Name of the ordered post-stage queue for a (team, dataset).
    pub fn stage_b_queue(&self, team: &str, dataset: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}-queue-b.fifo",
            self.prefix, team, dataset, self.org, self.app, self.env
        )
    }

    /// Name of the dead-letter queue paired with the post-stage queue.
    pub fn stage_b_dlq(&self, team: &str, dataset: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}-dlq-b.fifo",
            self.prefix, team, dataset, self.org, self.app, self.env
        )
    }

    /// Name of the per-object (Stage A) workflow for a (team, pipeline).
    pub fn stage_a_workflow(&self, team: &str, pipeline: &str) -> String {
        format!("{}-{}-{}-sm-a", self.prefix, team, pipeline)
    }

    /// Name of the batched (Stage B) workflow for a (team, pipeline).
    pub fn stage_b_workflow(&self, team: &str, pipeline: &str) -> String {
        format!("{}-{}-{}-sm-b", self.prefix, team, pipeline)
    }

    /// Name of the post-stage schema crawler for a (team, dataset).
    pub fn crawler(&self, team: &str, dataset: &str) -> String {
        format!("{}-{}-{}-post-stage-crawler", self.prefix, team, dataset)
    }
}

/// Path layout used to classify landed-object keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PathLayout {
    /// One bucket per team: keys look like `landing/{team}/{dataset}/...`.
    SingleBucket,
    /// Team-owned buckets: keys start with `{team}/{dataset}/...`.
    #[default]
    MultiBucket,
}

impl PathLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathLayout::SingleBucket => "single_bucket",
            PathLayout::MultiBucket => "multi_bucket",
        }
    }
}

/// Object storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving transformed objects.
    pub stage_bucket: String,
    /// Local scratch directory cleared after every transform invocation.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
}

fn default_scratch_dir() -> String {
    std::env::temp_dir()
        .join("floe-scratch")
        .to_string_lossy()
        .into_owned()
}

/// Per-dataset pipeline registration.
///
/// Seeds the dataset registry and transform mapping for local runs; the
/// orchestrators still resolve mappings through the catalog on every
/// invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub team: String,
    pub dataset: String,
    pub pipeline: String,
    /// Smallest batch the accumulator will hand to Stage B.
    #[serde(default = "default_min_items")]
    pub min_items_process: usize,
    /// Largest batch the accumulator will drain in one sweep.
    #[serde(default = "default_max_items")]
    pub max_items_process: usize,
    /// Registered name of the Stage A transform plugin.
    pub stage_a_transform: String,
    /// Registered name of the Stage B transform plugin.
    pub stage_b_transform: String,
}

fn default_min_items() -> usize {
    1
}

fn default_max_items() -> usize {
    100
}

/// Maintenance loop configuration for the worker binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval in seconds between accumulator/redrive sweeps (default: 60).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment
    /// variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;

        let content = if interpolate_env {
            let result = vars::interpolate(&content);
            if !result.is_ok() {
                let error_msg = result.errors.join("\n");
                return EnvInterpolationSnafu { message: error_msg }.fail();
            }
            result.text
        } else {
            content
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.storage.stage_bucket.is_empty(), EmptyStageBucketSnafu);
        ensure!(
            !self.naming.org.is_empty(),
            EmptyNamingFieldSnafu { field: "org" }
        );
        ensure!(
            !self.naming.app.is_empty(),
            EmptyNamingFieldSnafu { field: "app" }
        );
        ensure!(
            !self.naming.env.is_empty(),
            EmptyNamingFieldSnafu { field: "env" }
        );
        for ds in &self.datasets {
            ensure!(
                ds.min_items_process > 0 && ds.min_items_process <= ds.max_items_process,
                InvalidBatchWindowSnafu {
                    team: ds.team.clone(),
                    dataset: ds.dataset.clone(),
                    min: ds.min_items_process,
                    max: ds.max_items_process,
                }
            );
        }
        Ok(())
    }
}
