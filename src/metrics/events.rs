//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus counter metric.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of an orchestrated stage invocation.
#[derive(Debug, Clone, Copy)]
pub enum StageOutcome {
    Success,
    Failed,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::Failed => "failed",
        }
    }
}

/// Event emitted when landed objects are routed onto an ingress queue.
pub struct EventsRouted {
    pub count: u64,
}

impl InternalEvent for EventsRouted {
    fn emit(self) {
        trace!(count = self.count, "Events routed");
        counter!("floe_events_routed_total").increment(self.count);
    }
}

/// Event emitted when an event cannot be classified or enqueued.
pub struct RoutingFailed;

impl InternalEvent for RoutingFailed {
    fn emit(self) {
        trace!("Routing failed");
        counter!("floe_routing_failures_total").increment(1);
    }
}

/// Event emitted when a Stage A invocation finishes.
pub struct StageAExecution {
    pub outcome: StageOutcome,
}

impl InternalEvent for StageAExecution {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Stage A execution");
        counter!("floe_stage_a_executions_total", "outcome" => self.outcome.as_str())
            .increment(1);
    }
}

/// Event emitted when a Stage B submit or poll finishes.
pub struct StageBExecution {
    pub outcome: StageOutcome,
}

impl InternalEvent for StageBExecution {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Stage B execution");
        counter!("floe_stage_b_executions_total", "outcome" => self.outcome.as_str())
            .increment(1);
    }
}

/// Event emitted when the accumulator hands a batch to Stage B.
pub struct BatchTriggered {
    pub keys: u64,
}

impl InternalEvent for BatchTriggered {
    fn emit(self) {
        trace!(keys = self.keys, "Batch triggered");
        counter!("floe_batches_triggered_total").increment(1);
        counter!("floe_batch_keys_total").increment(self.keys);
    }
}

/// Event emitted when duplicate keys are dropped from a drained batch.
pub struct BatchKeysDeduplicated {
    pub count: u64,
}

impl InternalEvent for BatchKeysDeduplicated {
    fn emit(self) {
        trace!(count = self.count, "Batch keys deduplicated");
        counter!("floe_batch_keys_deduplicated_total").increment(self.count);
    }
}

/// Event emitted when a dead-lettered message is moved back onto its
/// primary queue.
pub struct MessagesRedriven {
    pub count: u64,
}

impl InternalEvent for MessagesRedriven {
    fn emit(self) {
        trace!(count = self.count, "Messages redriven");
        counter!("floe_messages_redriven_total").increment(self.count);
    }
}

/// Event emitted when a pipeline execution record reaches a terminal state.
pub struct PehTerminated {
    pub outcome: StageOutcome,
}

impl InternalEvent for PehTerminated {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Pipeline execution ended");
        counter!("floe_peh_terminated_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Event emitted when an object record is upserted into the catalog.
pub struct CatalogUpserts {
    pub count: u64,
}

impl InternalEvent for CatalogUpserts {
    fn emit(self) {
        trace!(count = self.count, "Catalog upserts");
        counter!("floe_catalog_upserts_total").increment(self.count);
    }
}
