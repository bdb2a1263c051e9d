//! Workflow execution service interface.
//!
//! Stage B work is handed to an external state-machine service; the
//! pipeline only ever starts executions and never waits on them.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{StartExecutionSnafu, WorkflowError};

/// Client for the external workflow execution service.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Start an execution of the named workflow and return its id.
    async fn start_execution(&self, name: &str, payload: Value) -> Result<String, WorkflowError>;
}

/// A recorded workflow start.
#[derive(Debug, Clone)]
pub struct StartedExecution {
    pub workflow: String,
    pub execution_id: String,
    pub payload: Value,
}

/// In-memory workflow client that records every started execution.
#[derive(Default)]
pub struct MemoryWorkflow {
    executions: Mutex<Vec<StartedExecution>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent start attempt fail with the given message.
    pub async fn fail_with(&self, message: &str) {
        *self.fail_with.lock().await = Some(message.to_string());
    }

    /// All executions started so far.
    pub async fn started(&self) -> Vec<StartedExecution> {
        self.executions.lock().await.clone()
    }
}

#[async_trait]
impl WorkflowClient for MemoryWorkflow {
    async fn start_execution(&self, name: &str, payload: Value) -> Result<String, WorkflowError> {
        if let Some(message) = self.fail_with.lock().await.clone() {
            return StartExecutionSnafu { name, message }.fail();
        }

        let execution_id = Uuid::new_v4().to_string();
        info!(workflow = name, execution_id, "Starting workflow execution");
        self.executions.lock().await.push(StartedExecution {
            workflow: name.to_string(),
            execution_id: execution_id.clone(),
            payload,
        });
        Ok(execution_id)
    }
}
