//! Ingress router for landed-object events.
//!
//! Classifies each landed object into (team, dataset, partition) using the
//! configured path layout, resolves the dataset's active pipeline, and
//! enqueues a routed message onto that pipeline's ordered ingress queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{NamingConfig, PathLayout};
use crate::emit;
use crate::error::{
    CatalogSnafu, MalformedNotificationSnafu, PayloadSerializeSnafu, PipelineError, QueueSnafu,
    RoutingError, RoutingSnafu, UnroutableKeySnafu,
};
use crate::metrics::events::{EventsRouted, RoutingFailed};
use crate::services::catalog::{MetadataCatalog, ObjectStage};
use crate::services::queue::OrderedQueue;

/// A landed-object notification, as emitted by the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub landing_time: DateTime<Utc>,
    pub stage: ObjectStage,
}

impl ObjectEvent {
    /// Parse a single S3-style notification record.
    pub fn from_notification(record: &Value) -> Result<Self, RoutingError> {
        let object = &record["s3"]["object"];
        let bucket = record["s3"]["bucket"]["name"]
            .as_str()
            .context(MalformedNotificationSnafu {
                message: "missing s3.bucket.name",
            })?;
        let key = object["key"].as_str().context(MalformedNotificationSnafu {
            message: "missing s3.object.key",
        })?;
        let size = object["size"].as_u64().context(MalformedNotificationSnafu {
            message: "missing s3.object.size",
        })?;
        let landing_time = record["eventTime"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .context(MalformedNotificationSnafu {
                message: "missing or invalid eventTime",
            })?;

        Ok(Self {
            bucket: bucket.to_string(),
            key: unquote_plus(key),
            size,
            landing_time: landing_time.with_timezone(&Utc),
            stage: ObjectStage::Raw,
        })
    }
}

/// Decode URL-encoded object keys, treating `+` as space.
fn unquote_plus(key: &str) -> String {
    let mut bytes = key.bytes();
    let mut decoded = Vec::with_capacity(key.len());
    while let Some(b) = bytes.next() {
        match b {
            b'+' => decoded.push(b' '),
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        let hex = [hi, lo];
                        match u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or(""), 16) {
                            Ok(byte) => decoded.push(byte),
                            Err(_) => decoded.extend_from_slice(&[b'%', hi, lo]),
                        }
                    }
                    _ => decoded.push(b'%'),
                }
            }
            other => decoded.push(other),
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// A routed message: the landed object plus its classification.
///
/// Group key is `"{team}-{dataset}"`; each enqueue gets a freshly generated
/// deduplication id (delivery is at-least-once, not exactly-once).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub bucket: String,
    pub key: String,
    pub stage: ObjectStage,
    pub size: u64,
    pub landing_time: DateTime<Utc>,
    pub team: String,
    pub dataset: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl RoutedMessage {
    /// Ordering/group key for queue sends.
    pub fn group(&self) -> String {
        format!("{}-{}", self.team, self.dataset)
    }
}

/// Classification of an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub team: String,
    pub dataset: String,
    pub partition: Option<String>,
}

/// Derive (team, dataset, partition) from an object key.
///
/// Single-bucket layout: `[ignored, team, dataset, ...]`, no partition.
/// Multi-bucket layout with exactly 5 segments: the dataset name spans
/// segments 1 and 2; otherwise team and dataset are the first two
/// segments. In both multi-bucket forms the partition is the next-to-last
/// segment.
pub fn classify(key: &str, layout: PathLayout) -> Result<Route, RoutingError> {
    let segments: Vec<&str> = key.split('/').collect();
    ensure!(
        segments.len() >= 3,
        UnroutableKeySnafu {
            key,
            layout: layout.as_str(),
        }
    );

    let route = match layout {
        PathLayout::SingleBucket => Route {
            team: segments[1].to_string(),
            dataset: segments[2].to_string(),
            partition: None,
        },
        PathLayout::MultiBucket if segments.len() == 5 => Route {
            team: segments[0].to_string(),
            dataset: format!("{}-{}", segments[1], segments[2]),
            partition: Some(segments[segments.len() - 2].to_string()),
        },
        PathLayout::MultiBucket => Route {
            team: segments[0].to_string(),
            dataset: segments[1].to_string(),
            partition: Some(segments[segments.len() - 2].to_string()),
        },
    };
    Ok(route)
}

/// Routes landed-object events onto per-pipeline ordered queues.
pub struct Router {
    catalog: Arc<dyn MetadataCatalog>,
    queue: Arc<dyn OrderedQueue>,
    naming: NamingConfig,
    layout: PathLayout,
}

impl Router {
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        queue: Arc<dyn OrderedQueue>,
        naming: NamingConfig,
        layout: PathLayout,
    ) -> Self {
        Self {
            catalog,
            queue,
            naming,
            layout,
        }
    }

    /// Route a single landed-object event.
    ///
    /// Any classification, lookup or enqueue failure is fatal for this
    /// event and re-raised so the invoking fan-out mechanism can retry or
    /// dead-letter it.
    pub async fn route_event(&self, event: &ObjectEvent) -> Result<RoutedMessage, PipelineError> {
        let route = classify(&event.key, self.layout).context(RoutingSnafu)?;
        let pipeline = self
            .catalog
            .dataset_pipeline(&route.team, &route.dataset)
            .await
            .context(CatalogSnafu)?;

        let message = RoutedMessage {
            bucket: event.bucket.clone(),
            key: event.key.clone(),
            stage: event.stage,
            size: event.size,
            landing_time: event.landing_time,
            team: route.team,
            dataset: route.dataset,
            pipeline,
            partition: route.partition,
        };

        let queue_name = self.naming.stage_a_queue(&message.team, &message.pipeline);
        info!(
            team = message.team,
            pipeline = message.pipeline,
            queue = queue_name,
            "Sending event to pipeline queue for processing"
        );

        let body = serde_json::to_string(&message).context(PayloadSerializeSnafu)?;
        self.queue
            .send_message(
                &queue_name,
                &body,
                &message.group(),
                &Uuid::new_v4().to_string(),
            )
            .await
            .context(QueueSnafu)?;
        emit!(EventsRouted { count: 1 });
        Ok(message)
    }

    /// Route a batch of events, each processed independently.
    ///
    /// Stops at the first failure; events already enqueued stay enqueued,
    /// and the error is never swallowed.
    pub async fn route_batch(&self, events: &[ObjectEvent]) -> Result<(), PipelineError> {
        info!("Received {} events", events.len());
        for event in events {
            if let Err(e) = self.route_event(event).await {
                error!(key = event.key, "Fatal error routing event: {e}");
                emit!(RoutingFailed);
                return Err(e);
            }
        }
        Ok(())
    }
}
