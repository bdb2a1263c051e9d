//! Error types for floe using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

// ============ Routing Errors ============

/// Errors raised while classifying a landed-object event.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RoutingError {
    /// Object key does not match any known path layout.
    #[snafu(display("Object key '{key}' does not match the {layout} layout"))]
    UnroutableKey { key: String, layout: String },

    /// Object-store notification payload is missing required fields.
    #[snafu(display("Malformed object-store notification: {message}"))]
    MalformedNotification { message: String },
}

// ============ Catalog Errors ============

/// Errors raised by the metadata catalog and its configuration lookups.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// No active pipeline registered for the dataset.
    #[snafu(display("No pipeline registered for dataset '{team}-{dataset}'"))]
    PipelineNotFound { team: String, dataset: String },

    /// No transform mapping configured for the dataset.
    #[snafu(display("No transform mapping for dataset '{team}-{dataset}'"))]
    MappingNotFound { team: String, dataset: String },

    /// The underlying key-value store failed.
    #[snafu(display("Metadata store operation failed: {message}"))]
    CatalogStore { message: String },
}

// ============ Queue Errors ============

/// Errors raised by the ordered queue abstraction.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// A delete was attempted with a receipt that is not in flight.
    #[snafu(display("Receipt '{receipt}' is not in flight on queue '{queue}'"))]
    UnknownReceipt { queue: String, receipt: String },

    /// The queue transport failed.
    #[snafu(display("Queue transport failed: {message}"))]
    Transport { message: String },
}

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },
}

// ============ PEH Errors ============

/// Errors raised by the pipeline execution history tracker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PehError {
    /// No execution record exists for the given id.
    #[snafu(display("Pipeline execution '{id}' not found"))]
    ExecutionNotFound { id: String },

    /// The execution already reached success or failure; further
    /// transitions are rejected.
    #[snafu(display("Pipeline execution '{id}' is already terminal"))]
    AlreadyTerminal { id: String },

    /// The underlying execution history store failed.
    #[snafu(display("Execution history store failed: {message}"))]
    PehStore { message: String },
}

// ============ Transform Errors ============

/// Errors raised by transform plugin lookup, dispatch, and result
/// validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// No Stage A plugin registered under the mapped name.
    #[snafu(display("No Stage A transform registered under '{name}'"))]
    UnknownStageATransform { name: String },

    /// No Stage B plugin registered under the mapped name.
    #[snafu(display("No Stage B transform registered under '{name}'"))]
    UnknownStageBTransform { name: String },

    /// A Stage A plugin returned an empty list of processed keys.
    #[snafu(display("Invalid list of processed keys - Aborting"))]
    EmptyKeyList,

    /// A Stage B plugin response is missing a required field.
    #[snafu(display("Invalid job response: missing '{field}' - Aborting"))]
    MissingJobField { field: &'static str },

    /// A Stage B plugin reported a status outside the known set.
    #[snafu(display("Invalid job response: unknown job status '{status}'"))]
    UnknownJobStatus { status: String },

    /// The asynchronous Stage B job reached the FAILED terminal state.
    #[snafu(display("Job failed: {message}"))]
    JobFailed { message: String },

    /// The plugin itself raised while executing.
    #[snafu(display("Transform execution failed: {message}"))]
    Execution { message: String },
}

// ============ Workflow / Crawler Errors ============

/// Errors raised when starting a downstream workflow execution.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkflowError {
    #[snafu(display("Failed to start workflow '{name}': {message}"))]
    StartExecution { name: String, message: String },
}

/// Errors raised when triggering a schema crawl.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CrawlerError {
    #[snafu(display("Failed to start crawler '{name}': {message}"))]
    StartCrawl { name: String, message: String },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Stage bucket must be configured.
    #[snafu(display("Stage bucket cannot be empty"))]
    EmptyStageBucket,

    /// Naming components must all be present.
    #[snafu(display("Naming field '{field}' cannot be empty"))]
    EmptyNamingField { field: &'static str },

    /// A dataset's batch window is inverted or zero.
    #[snafu(display(
        "Dataset '{team}-{dataset}' has an invalid batch window: min {min}, max {max}"
    ))]
    InvalidBatchWindow {
        team: String,
        dataset: String,
        min: usize,
        max: usize,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Event classification error.
    #[snafu(display("Routing error"))]
    Routing { source: RoutingError },

    /// Metadata catalog error.
    #[snafu(display("Catalog error"))]
    Catalog { source: CatalogError },

    /// Ordered queue error.
    #[snafu(display("Queue error"))]
    Queue { source: QueueError },

    /// Object storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Execution history error.
    #[snafu(display("Execution history error"))]
    Peh { source: PehError },

    /// Transform dispatch error.
    #[snafu(display("Transform error"))]
    Transform { source: TransformError },

    /// Crawler trigger error.
    #[snafu(display("Crawler error"))]
    Crawler { source: CrawlerError },

    /// A downstream trigger failed after upstream work was already
    /// committed; the affected keys were redirected to the dead-letter
    /// path rather than dropped.
    #[snafu(display("Downstream trigger failed after work was performed: {message}"))]
    DownstreamTrigger { message: String },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Payload serialization error.
    #[snafu(display("Failed to serialize payload"))]
    PayloadSerialize { source: serde_json::Error },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// Check if this error is a contract violation raised by transform
    /// result validation.
    pub fn is_invalid_transform_result(&self) -> bool {
        matches!(
            self,
            PipelineError::Transform {
                source: TransformError::EmptyKeyList
                    | TransformError::MissingJobField { .. }
                    | TransformError::UnknownJobStatus { .. }
            }
        )
    }

    /// Check if this error is a terminal FAILED job status.
    pub fn is_job_failed(&self) -> bool {
        matches!(
            self,
            PipelineError::Transform {
                source: TransformError::JobFailed { .. }
            }
        )
    }
}
