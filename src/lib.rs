//! floe: a staged ingestion orchestrator for data lake pipelines.
//!
//! Landed objects flow through a two-stage pipeline: a per-object light
//! transform (Stage A) followed by a batched heavy transform with
//! asynchronous job polling (Stage B), with metadata cataloging and
//! execution-history auditing at every step. The managed services the
//! pipeline runs on — ordered queues, object storage, the metadata store,
//! workflow executions, schema crawls — are narrow trait collaborators
//! with in-memory implementations for local runs and tests.
//!
//! # Example
//!
//! ```ignore
//! use floe::config::Config;
//! use floe::pipeline::{ObjectEvent, Router};
//!
//! let config = Config::from_file("config.yaml")?;
//! let router = Router::new(catalog, queue, config.naming.clone(), config.layout);
//! router.route_batch(&events).await?;
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod peh;
pub mod pipeline;
pub mod poll;
pub mod services;
pub mod transform;

// Re-export main types
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{
    BatchAccumulator, MaintenanceSweep, ObjectEvent, Redrive, RoutedMessage, Router,
    StageAOrchestrator, StageBOrchestrator,
};
pub use transform::{TransformDispatch, TransformRegistry};
