//! Thin client facade over a running [`Runtime`].
//!
//! Applications hold a `Client` rather than the runtime itself; it covers the
//! control-plane surface (start, status, history, terminate) plus a
//! convenience run-and-wait helper.

use std::sync::Arc;
use std::time::Duration;

use crate::providers::Recorded;
use crate::runtime::{Runtime, WaitError, WorkflowDescriptor, WorkflowStatus};
use serde::{Serialize, de::DeserializeOwned};

#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Start a workflow instance with a raw string input. Returns once the
    /// start event is durably recorded; the workflow runs in the background.
    pub async fn start_workflow(
        &self,
        instance: &str,
        workflow_name: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        let _ = self
            .runtime
            .clone()
            .start_workflow(instance, workflow_name, input)
            .await?;
        Ok(())
    }

    /// Start a workflow with typed input (serialized to JSON).
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        instance: &str,
        workflow_name: &str,
        input: In,
    ) -> Result<(), String> {
        let payload = crate::codec::encode(&input).map_err(|e| format!("encode: {e}"))?;
        self.start_workflow(instance, workflow_name, payload).await
    }

    /// Current status of an instance, derived from its history.
    pub async fn get_workflow_status(&self, instance: &str) -> WorkflowStatus {
        self.runtime.get_workflow_status(instance).await
    }

    /// Descriptor for an instance, or `None` if it was never started.
    pub async fn get_workflow_descriptor(&self, instance: &str) -> Option<WorkflowDescriptor> {
        self.runtime.get_workflow_descriptor(instance).await
    }

    /// Enumerate known instance ids, children included.
    pub async fn list_workflows(&self) -> Vec<String> {
        self.runtime.list_workflows().await
    }

    /// Full recorded history for an instance.
    pub async fn read_history(&self, instance: &str) -> Vec<Recorded> {
        self.runtime.read_history(instance).await
    }

    /// Request termination of a running instance. Idempotent; terminating a
    /// finished instance is a no-op.
    pub async fn terminate_workflow(&self, instance: &str, reason: impl Into<String>) {
        self.runtime.terminate_workflow(instance, reason).await
    }

    /// Wait until the instance reaches a terminal status.
    pub async fn wait_for_workflow(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<WorkflowStatus, WaitError> {
        self.runtime.wait_for_workflow(instance, timeout).await
    }

    /// Start a workflow and wait for its output.
    pub async fn run_and_wait(
        &self,
        instance: &str,
        workflow_name: &str,
        input: impl Into<String>,
        timeout: Duration,
    ) -> Result<Result<String, String>, WaitError> {
        self.start_workflow(instance, workflow_name, input)
            .await
            .map_err(WaitError::Other)?;
        match self.wait_for_workflow(instance, timeout).await? {
            WorkflowStatus::Completed { output } => Ok(Ok(output)),
            WorkflowStatus::Failed { error } => Ok(Err(error)),
            WorkflowStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            _ => Err(WaitError::Other("non-terminal status from wait".to_string())),
        }
    }

    /// Typed run-and-wait: serializes the input and decodes the output.
    pub async fn run_and_wait_typed<In, Out>(
        &self,
        instance: &str,
        workflow_name: &str,
        input: In,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let payload = crate::codec::encode(&input).map_err(|e| WaitError::Other(format!("encode: {e}")))?;
        match self.run_and_wait(instance, workflow_name, payload, timeout).await? {
            Ok(s) => match crate::codec::decode::<Out>(&s) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            Err(e) => Ok(Err(e)),
        }
    }
}
