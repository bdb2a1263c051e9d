//! Ordered FIFO queue abstraction.
//!
//! Models the managed message queue the pipeline runs on: per-group
//! in-order delivery, at-least-once semantics, deduplication-id
//! suppression, and an explicit receive/delete cycle for consumers that
//! need to confirm processing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, UnknownReceiptSnafu};

/// Maximum number of messages in a single batched send.
pub const MAX_BATCH_SEND: usize = 10;

/// A message received from an ordered queue.
///
/// The receipt must be passed back to `delete_message` once the message
/// has been fully processed; until then the message is in flight.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: String,
    pub group: String,
    pub receipt: String,
}

/// Ordered queue operations used by the pipeline.
///
/// Delivery is at-least-once: consumers must tolerate duplicates. Ordering
/// is guaranteed only among messages sharing a group key.
#[async_trait]
pub trait OrderedQueue: Send + Sync {
    /// Send a single message. Messages with a previously seen
    /// deduplication id are dropped.
    async fn send_message(
        &self,
        queue: &str,
        body: &str,
        group: &str,
        dedup_id: &str,
    ) -> Result<(), QueueError>;

    /// Send a batch of messages under one group key, chunked into sends
    /// of at most [`MAX_BATCH_SEND`]. Each message gets a fresh
    /// deduplication id.
    async fn send_batch(
        &self,
        queue: &str,
        bodies: &[String],
        group: &str,
    ) -> Result<(), QueueError>;

    /// Receive up to `max` messages, moving them in flight until deleted.
    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Drain between `min` and `max` message bodies.
    ///
    /// If fewer than `min` messages are currently visible, nothing is
    /// consumed and an empty vector is returned; the messages stay on the
    /// queue. Otherwise up to `max` messages are removed and their bodies
    /// returned.
    async fn receive_min_max(
        &self,
        queue: &str,
        min: usize,
        max: usize,
    ) -> Result<Vec<String>, QueueError>;

    /// Delete an in-flight message by its receipt.
    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    group: String,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
    seen_dedup_ids: HashSet<String>,
}

/// In-memory ordered queue used for local runs and tests.
///
/// Queues are created on first send; receiving from a queue that has never
/// seen a message yields nothing.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently visible messages on a queue.
    pub async fn visible_len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.visible.len())
    }

    /// Number of in-flight (received but not deleted) messages on a queue.
    pub async fn in_flight_len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.in_flight.len())
    }
}

#[async_trait]
impl OrderedQueue for MemoryQueue {
    async fn send_message(
        &self,
        queue: &str,
        body: &str,
        group: &str,
        dedup_id: &str,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        if !state.seen_dedup_ids.insert(dedup_id.to_string()) {
            debug!(queue, dedup_id, "Dropping duplicate message");
            return Ok(());
        }
        state.visible.push_back(StoredMessage {
            body: body.to_string(),
            group: group.to_string(),
        });
        Ok(())
    }

    async fn send_batch(
        &self,
        queue: &str,
        bodies: &[String],
        group: &str,
    ) -> Result<(), QueueError> {
        for chunk in bodies.chunks(MAX_BATCH_SEND) {
            for body in chunk {
                self.send_message(queue, body, group, &Uuid::new_v4().to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut received = Vec::new();
        while received.len() < max {
            let Some(stored) = state.visible.pop_front() else {
                break;
            };
            let receipt = Uuid::new_v4().to_string();
            state.in_flight.insert(receipt.clone(), stored.clone());
            received.push(QueueMessage {
                body: stored.body,
                group: stored.group,
                receipt,
            });
        }
        Ok(received)
    }

    async fn receive_min_max(
        &self,
        queue: &str,
        min: usize,
        max: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        if state.visible.len() < min {
            debug!(
                queue,
                available = state.visible.len(),
                min,
                "Below minimum batch threshold, leaving messages visible"
            );
            return Ok(Vec::new());
        }

        let take = state.visible.len().min(max);
        let bodies = state.visible.drain(..take).map(|m| m.body).collect();
        Ok(bodies)
    }

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let removed = queues
            .get_mut(queue)
            .and_then(|state| state.in_flight.remove(receipt));
        match removed {
            Some(_) => Ok(()),
            None => UnknownReceiptSnafu {
                queue: queue.to_string(),
                receipt: receipt.to_string(),
            }
            .fail(),
        }
    }
}
