//! In-process routing of completion messages to active instance inboxes.
//!
//! The dispatchers translate durable work items into `SchedulerMsg`s carrying
//! the queue lock token; the token is acked only after the resulting history
//! append is persisted, so a crash in between redelivers the item.

use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};

use crate::ActivityError;

/// Completion or control message delivered to a running instance.
#[derive(Debug)]
pub enum SchedulerMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: ActivityError,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    SubWorkflowCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    SubWorkflowFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    Terminate {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl SchedulerMsg {
    pub fn instance(&self) -> &str {
        match self {
            SchedulerMsg::ActivityCompleted { instance, .. }
            | SchedulerMsg::ActivityFailed { instance, .. }
            | SchedulerMsg::TimerFired { instance, .. }
            | SchedulerMsg::SubWorkflowCompleted { instance, .. }
            | SchedulerMsg::SubWorkflowFailed { instance, .. }
            | SchedulerMsg::Terminate { instance, .. } => instance,
        }
    }

    pub fn take_ack_token(&mut self) -> Option<String> {
        match self {
            SchedulerMsg::ActivityCompleted { ack_token, .. }
            | SchedulerMsg::ActivityFailed { ack_token, .. }
            | SchedulerMsg::TimerFired { ack_token, .. }
            | SchedulerMsg::SubWorkflowCompleted { ack_token, .. }
            | SchedulerMsg::SubWorkflowFailed { ack_token, .. }
            | SchedulerMsg::Terminate { ack_token, .. } => ack_token.take(),
        }
    }
}

/// Maps instance ids to the inbox of their running scheduler task.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<SchedulerMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Register an inbox for an instance, returning its receiver.
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<SchedulerMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Forward a message to its instance inbox; returns the message back if
    /// the instance has no inbox (dehydrated or finished).
    pub async fn try_send(&self, msg: SchedulerMsg) -> Result<(), SchedulerMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }
}

impl Default for InstanceRouter {
    fn default() -> Self {
        Self::new()
    }
}
