//! Status and introspection helpers derived from persisted history.

use super::Runtime;
use crate::Event;

/// High-level workflow status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed { .. } | WorkflowStatus::Failed { .. } | WorkflowStatus::Terminated { .. }
        )
    }
}

/// Introspection: descriptor of a workflow instance from its start event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDescriptor {
    pub name: String,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
}

/// Derive status from an event log. An empty log means the instance was
/// never started.
pub fn derive_status(events: &[Event]) -> WorkflowStatus {
    if events.is_empty() {
        return WorkflowStatus::NotFound;
    }
    for e in events.iter().rev() {
        match e {
            Event::WorkflowCompleted { output } => {
                return WorkflowStatus::Completed { output: output.clone() };
            }
            Event::WorkflowFailed { error } => {
                return WorkflowStatus::Failed { error: error.clone() };
            }
            Event::WorkflowTerminated { reason } => {
                return WorkflowStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    WorkflowStatus::Running
}

impl Runtime {
    /// Current status of an instance, read from the store.
    pub async fn get_workflow_status(&self, instance: &str) -> WorkflowStatus {
        let events = self.store.read_events(instance).await;
        derive_status(&events)
    }

    /// Descriptor `{ name, parent_instance?, parent_id? }` for an instance,
    /// or `None` if it has no start event.
    pub async fn get_workflow_descriptor(&self, instance: &str) -> Option<WorkflowDescriptor> {
        let events = self.store.read_events(instance).await;
        events.iter().find_map(|e| match e {
            Event::WorkflowStarted {
                name,
                parent_instance,
                parent_id,
                ..
            } => Some(WorkflowDescriptor {
                name: name.clone(),
                parent_instance: parent_instance.clone(),
                parent_id: *parent_id,
            }),
            _ => None,
        })
    }

    /// Enumerate known instance ids.
    pub async fn list_workflows(&self) -> Vec<String> {
        self.store.list_instances().await
    }

    /// Full recorded history for an instance.
    pub async fn read_history(&self, instance: &str) -> Vec<crate::providers::Recorded> {
        self.store.read(instance).await
    }
}
