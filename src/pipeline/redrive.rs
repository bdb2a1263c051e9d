//! Dead-letter redrive.
//!
//! Moves dead-lettered messages back onto their originating ordered queue
//! for reprocessing, one small batch at a time. A message is deleted from
//! the dead-letter queue only after it has been re-enqueued, so a crash in
//! between yields a harmless duplicate, never a loss.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::emit;
use crate::error::{PipelineError, QueueSnafu};
use crate::metrics::events::MessagesRedriven;
use crate::services::queue::OrderedQueue;

/// Group key applied to redriven messages.
const REDRIVE_GROUP: &str = "redrive";

/// Maintenance task that drains a dead-letter queue back onto its
/// primary queue.
pub struct Redrive {
    queue: Arc<dyn OrderedQueue>,
}

impl Redrive {
    pub fn new(queue: Arc<dyn OrderedQueue>) -> Self {
        Self { queue }
    }

    /// Move at most one message from the dead-letter queue back onto the
    /// primary queue. Returns the number of messages moved; zero is a
    /// no-op.
    pub async fn run(&self, dlq_name: &str, primary_name: &str) -> Result<usize, PipelineError> {
        let messages = self
            .queue
            .receive_messages(dlq_name, 1)
            .await
            .context(QueueSnafu)?;
        if messages.is_empty() {
            info!("No messages found in {dlq_name}");
            return Ok(0);
        }

        info!("Received {} messages", messages.len());
        let mut moved = 0;
        for message in messages {
            self.queue
                .send_message(
                    primary_name,
                    &message.body,
                    REDRIVE_GROUP,
                    &Uuid::new_v4().to_string(),
                )
                .await
                .context(QueueSnafu)?;
            self.queue
                .delete_message(dlq_name, &message.receipt)
                .await
                .context(QueueSnafu)?;
            info!("Delete message succeeded");
            moved += 1;
        }
        emit!(MessagesRedriven {
            count: moved as u64
        });
        Ok(moved)
    }
}
