//! Pipeline execution history (PEH) tracking.
//!
//! Every orchestrated stage invocation is wrapped in an execution record:
//! started before any work, advanced as components run, and closed with
//! exactly one terminal transition — success or failure — even when the
//! orchestrator raises. Records live in an external key-value store and
//! are queryable independently of application logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::emit;
use crate::error::{AlreadyTerminalSnafu, ExecutionNotFoundSnafu, PehError};
use crate::metrics::events::{PehTerminated, StageOutcome};

/// Lifecycle state of one execution record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PehState {
    Running,
    Succeeded,
    Failed,
}

impl PehState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PehState::Running)
    }
}

/// One end-to-end run of a stage for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PehRecord {
    pub id: String,
    pub pipeline_name: String,
    pub state: PehState,
    /// Last human-readable status line, e.g. "Pre-Stage Process Processing".
    pub status: String,
    /// Component that last advanced (or failed) the execution.
    pub component: Option<String>,
    /// Free-text comment; carries the failure text on the error path.
    pub comment: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Storage for execution records, atomic per id.
#[async_trait]
pub trait PehStore: Send + Sync {
    async fn put(&self, record: PehRecord) -> Result<(), PehError>;
    async fn get(&self, id: &str) -> Result<Option<PehRecord>, PehError>;
}

/// In-memory execution history store used for local runs and tests.
#[derive(Default)]
pub struct MemoryPehStore {
    records: Mutex<HashMap<String, PehRecord>>,
}

impl MemoryPehStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in no particular order.
    pub async fn records(&self) -> Vec<PehRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Number of records still in the Running state.
    pub async fn running_count(&self) -> usize {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| r.state == PehState::Running)
            .count()
    }
}

#[async_trait]
impl PehStore for MemoryPehStore {
    async fn put(&self, record: PehRecord) -> Result<(), PehError> {
        self.records.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PehRecord>, PehError> {
        Ok(self.records.lock().await.get(id).cloned())
    }
}

/// Entry point for creating and resuming execution sessions.
#[derive(Clone)]
pub struct PehClient {
    store: Arc<dyn PehStore>,
}

impl PehClient {
    pub fn new(store: Arc<dyn PehStore>) -> Self {
        Self { store }
    }

    /// Create a new Running record and return its session.
    pub async fn start_pipeline_execution(
        &self,
        pipeline_name: &str,
        comment: &str,
    ) -> Result<PehSession, PehError> {
        let id = Uuid::new_v4().to_string();
        let record = PehRecord {
            id: id.clone(),
            pipeline_name: pipeline_name.to_string(),
            state: PehState::Running,
            status: "Started".to_string(),
            component: None,
            comment: Some(comment.to_string()),
            started_at: Utc::now(),
            ended_at: None,
        };
        debug!(peh_id = id, pipeline_name, "Starting pipeline execution");
        self.store.put(record).await?;
        Ok(PehSession {
            store: self.store.clone(),
            id,
        })
    }

    /// Load an existing record into a session.
    ///
    /// Required before any update or terminal call on an execution that
    /// was started elsewhere; an unknown id is a usage error.
    pub async fn retrieve_pipeline_execution(&self, id: &str) -> Result<PehSession, PehError> {
        self.store
            .get(id)
            .await?
            .context(ExecutionNotFoundSnafu { id })?;
        Ok(PehSession {
            store: self.store.clone(),
            id: id.to_string(),
        })
    }
}

/// An explicit handle on one execution record.
///
/// Terminal transitions consume the session, so a closed execution cannot
/// be advanced again through the same handle; the store additionally
/// rejects transitions on records that already reached a terminal state.
pub struct PehSession {
    store: Arc<dyn PehStore>,
    id: String,
}

impl PehSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn load_running(&self) -> Result<PehRecord, PehError> {
        let record = self
            .store
            .get(&self.id)
            .await?
            .context(ExecutionNotFoundSnafu { id: &self.id })?;
        ensure!(
            !record.state.is_terminal(),
            AlreadyTerminalSnafu { id: &self.id }
        );
        Ok(record)
    }

    /// Advance the status line and component. Idempotent while Running.
    pub async fn update(&self, status: &str, component: &str) -> Result<(), PehError> {
        let mut record = self.load_running().await?;
        record.status = status.to_string();
        record.component = Some(component.to_string());
        self.store.put(record).await
    }

    /// Close the execution as succeeded.
    pub async fn end_success(self) -> Result<(), PehError> {
        let mut record = self.load_running().await?;
        record.state = PehState::Succeeded;
        record.status = "Completed".to_string();
        record.ended_at = Some(Utc::now());
        debug!(peh_id = self.id, "Pipeline execution succeeded");
        self.store.put(record).await?;
        emit!(PehTerminated {
            outcome: StageOutcome::Success
        });
        Ok(())
    }

    /// Close the execution as failed, carrying the failure text.
    pub async fn end_failed(self, component: &str, comment: &str) -> Result<(), PehError> {
        let mut record = self.load_running().await?;
        record.state = PehState::Failed;
        record.status = "Failed".to_string();
        record.component = Some(component.to_string());
        record.comment = Some(comment.to_string());
        record.ended_at = Some(Utc::now());
        debug!(peh_id = self.id, component, "Pipeline execution failed");
        self.store.put(record).await?;
        emit!(PehTerminated {
            outcome: StageOutcome::Failed
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (PehClient, Arc<MemoryPehStore>) {
        let store = Arc::new(MemoryPehStore::new());
        (PehClient::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_start_update_success() {
        let (client, store) = client();

        let session = client
            .start_pipeline_execution("engineering-main-pre-stage", "landing event")
            .await
            .unwrap();
        let id = session.id().to_string();

        session
            .update("Pre-Stage Process Processing", "Process")
            .await
            .unwrap();
        // Updates are idempotent while running
        session
            .update("Pre-Stage Process Processing", "Process")
            .await
            .unwrap();
        session.end_success().await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, PehState::Succeeded);
        assert!(record.ended_at.is_some());
        assert_eq!(store.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_records_component_and_comment() {
        let (client, store) = client();

        let session = client
            .start_pipeline_execution("engineering-main-pre-stage", "landing event")
            .await
            .unwrap();
        let id = session.id().to_string();

        session
            .end_failed("Process", "Pre-Stage Process Error: boom")
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, PehState::Failed);
        assert_eq!(record.component.as_deref(), Some("Process"));
        assert_eq!(
            record.comment.as_deref(),
            Some("Pre-Stage Process Error: boom")
        );
    }

    #[tokio::test]
    async fn test_terminal_records_reject_transitions() {
        let (client, _store) = client();

        let session = client
            .start_pipeline_execution("engineering-main-post-stage", "batch")
            .await
            .unwrap();
        let id = session.id().to_string();
        session.end_success().await.unwrap();

        // A session resumed on a terminal record cannot advance it
        let resumed = client.retrieve_pipeline_execution(&id).await.unwrap();
        let err = resumed.update("Post-Stage Check Processing", "Check").await;
        assert!(matches!(err, Err(PehError::AlreadyTerminal { .. })));

        let resumed = client.retrieve_pipeline_execution(&id).await.unwrap();
        let err = resumed.end_failed("Check", "late failure").await;
        assert!(matches!(err, Err(PehError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn test_retrieve_unknown_id_is_an_error() {
        let (client, _store) = client();
        let err = client.retrieve_pipeline_execution("missing").await;
        assert!(matches!(err, Err(PehError::ExecutionNotFound { .. })));
    }
}
