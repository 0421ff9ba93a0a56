//! Storage abstraction for durable workflow state.
//!
//! A provider owns two things: append-only per-instance history logs and the
//! three work queues (orchestrator, worker, timer) the runtime dispatches
//! from. Appends assign a per-instance monotonic sequence number, and
//! completion-like events are deduplicated by correlation id so redelivered
//! work items cannot corrupt history.

use serde::{Deserialize, Serialize};

use crate::{ActivityError, Event};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;
pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// Upper bound on events per instance history.
pub(crate) const HISTORY_CAP: usize = 1024;

/// A persisted history event: the payload plus provider-assigned metadata.
/// `seq` is monotonic per instance starting at 1; `ts_ms` is wall-clock
/// capture time and carries no replay semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recorded {
    pub seq: u64,
    pub ts_ms: u64,
    pub event: Event,
}

/// The three dispatch queues owned by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Completions and control messages routed to workflow instances.
    Orchestrator,
    /// Activity invocations consumed by the worker pool.
    Worker,
    /// Armed timers awaiting their fire time.
    Timer,
}

/// Durable unit of work flowing through the queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// Run an activity for an instance (worker queue).
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    /// Activity result headed back to its instance (orchestrator queue).
    ActivityCompleted { instance: String, id: u64, result: String },
    /// Activity failure after retry exhaustion (orchestrator queue).
    ActivityFailed {
        instance: String,
        id: u64,
        error: ActivityError,
    },
    /// Arm a timer for an instance (timer queue).
    TimerSchedule { instance: String, id: u64, fire_at_ms: u64 },
    /// Timer elapsed (orchestrator queue).
    TimerFired { instance: String, id: u64, fire_at_ms: u64 },
    /// Child result routed to the parent instance (orchestrator queue).
    SubWorkflowCompleted {
        parent_instance: String,
        parent_id: u64,
        result: String,
    },
    /// Child failure routed to the parent instance (orchestrator queue).
    SubWorkflowFailed {
        parent_instance: String,
        parent_id: u64,
        error: String,
    },
    /// External request to terminate an instance (orchestrator queue).
    TerminateInstance { instance: String, reason: String },
}

impl WorkItem {
    /// Instance this item is routed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
            WorkItem::SubWorkflowCompleted { parent_instance, .. }
            | WorkItem::SubWorkflowFailed { parent_instance, .. } => parent_instance,
        }
    }
}

/// Dedupe key for completion-like events. Terminal events share a single
/// synthetic slot so only the first terminal ever lands in history.
pub(crate) fn completion_key(event: &Event) -> Option<(u64, &'static str)> {
    match event {
        Event::ActivityCompleted { id, .. } => Some((*id, "ac")),
        Event::ActivityFailed { id, .. } => Some((*id, "af")),
        Event::TimerFired { id, .. } => Some((*id, "tf")),
        Event::SubWorkflowCompleted { id, .. } => Some((*id, "sc")),
        Event::SubWorkflowFailed { id, .. } => Some((*id, "sf")),
        Event::WorkflowCompleted { .. } | Event::WorkflowFailed { .. } | Event::WorkflowTerminated { .. } => {
            Some((0, "terminal"))
        }
        _ => None,
    }
}

/// Append-only history log plus peek-lock work queues, per instance.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance. Errors if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Read the full recorded history for an instance (empty if unknown).
    async fn read(&self, instance: &str) -> Vec<Recorded>;

    /// Read only the event payloads, in sequence order.
    async fn read_events(&self, instance: &str) -> Vec<Event> {
        self.read(instance).await.into_iter().map(|r| r.event).collect()
    }

    /// Append events, assigning monotonic sequence numbers. Duplicate
    /// completion-like events are silently dropped. Returns the last
    /// sequence number in the log after the append.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;

    /// Enqueue a work item. Idempotent: an identical pending item is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Pop the next work item invisibly; it stays owned by the returned lock
    /// token until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Permanently discard a locked item. Unknown tokens are a no-op so
    /// redelivered acks stay idempotent.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return a locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Clear all provider data (test utility).
    async fn reset(&self);

    /// Pretty-printed dump of all instance histories (test utility).
    async fn dump_all_pretty(&self) -> String;
}
