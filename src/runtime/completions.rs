//! Applying completion messages to in-memory history, and re-arming pending
//! work after rehydration or crash recovery.

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::router::SchedulerMsg;
use crate::Event;
use std::sync::Arc;
use tracing::warn;

/// Result of applying one completion message to history.
pub(crate) enum CompletionOutcome {
    /// Event appended; ack only after the append is persisted.
    Applied { token: Option<String> },
    /// Duplicate or stale; history unchanged, safe to ack immediately.
    Ignored { token: Option<String> },
    /// Completion does not correlate to a scheduling event of its kind;
    /// the instance must fail as nondeterministic.
    Mismatch { token: Option<String>, error: String },
}

fn has_completion(history: &[Event], id: u64) -> bool {
    history.iter().any(|e| match e {
        Event::ActivityCompleted { id: cid, .. }
        | Event::ActivityFailed { id: cid, .. }
        | Event::TimerFired { id: cid, .. }
        | Event::SubWorkflowCompleted { id: cid, .. }
        | Event::SubWorkflowFailed { id: cid, .. } => *cid == id,
        _ => false,
    })
}

/// Find the scheduling event kind label for `id`, if any.
fn scheduled_kind(history: &[Event], id: u64) -> Option<&'static str> {
    history.iter().find_map(|e| match e {
        Event::ActivityScheduled { id: sid, .. } if *sid == id => Some("activity"),
        Event::TimerScheduled { id: sid, .. } if *sid == id => Some("timer"),
        Event::SubWorkflowScheduled { id: sid, .. } if *sid == id => Some("sub-workflow"),
        _ => None,
    })
}

/// Append one completion to history after validating correlation. Terminate
/// messages are not handled here; the scheduler loop treats them specially.
pub(crate) fn append_completion(history: &mut Vec<Event>, mut msg: SchedulerMsg) -> CompletionOutcome {
    let token = msg.take_ack_token();
    let (id, expected_kind, event) = match msg {
        SchedulerMsg::ActivityCompleted { id, result, .. } => {
            (id, "activity", Event::ActivityCompleted { id, result })
        }
        SchedulerMsg::ActivityFailed { id, error, .. } => (id, "activity", Event::ActivityFailed { id, error }),
        SchedulerMsg::TimerFired { id, fire_at_ms, .. } => (id, "timer", Event::TimerFired { id, fire_at_ms }),
        SchedulerMsg::SubWorkflowCompleted { id, result, .. } => {
            (id, "sub-workflow", Event::SubWorkflowCompleted { id, result })
        }
        SchedulerMsg::SubWorkflowFailed { id, error, .. } => {
            (id, "sub-workflow", Event::SubWorkflowFailed { id, error })
        }
        SchedulerMsg::Terminate { instance, .. } => {
            warn!(instance = %instance, "terminate message routed to append_completion; ignoring");
            return CompletionOutcome::Ignored { token };
        }
    };

    match scheduled_kind(history, id) {
        Some(kind) if kind == expected_kind => {}
        Some(kind) => {
            return CompletionOutcome::Mismatch {
                token,
                error: format!("completion kind mismatch: id {id} was scheduled as {kind}, completed as {expected_kind}"),
            };
        }
        None => {
            return CompletionOutcome::Mismatch {
                token,
                error: format!("completion for unknown correlation id {id} ({expected_kind})"),
            };
        }
    }

    // At-least-once delivery: a redelivered completion is dropped here and
    // again at the provider on append.
    if has_completion(history, id) {
        return CompletionOutcome::Ignored { token };
    }
    history.push(event);
    CompletionOutcome::Applied { token }
}

/// Re-enqueue work for scheduling events with no completion yet. Runs on
/// instance activation (fresh start, rehydration, and crash recovery); the
/// provider's idempotent enqueue and completion dedupe make re-arming safe
/// even when the original work is still in flight.
pub(crate) async fn rehydrate_pending(instance: &str, history: &[Event], store: &Arc<dyn HistoryStore>) {
    for e in history {
        match e {
            Event::ActivityScheduled { id, name, input } if !has_completion(history, *id) => {
                if let Err(err) = store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        },
                    )
                    .await
                {
                    warn!(instance, id, name = %name, error = %err, "failed to re-enqueue pending activity");
                }
            }
            Event::TimerScheduled { id, fire_at_ms } if !has_completion(history, *id) => {
                if let Err(err) = store
                    .enqueue_work(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await
                {
                    warn!(instance, id, error = %err, "failed to re-enqueue pending timer");
                }
            }
            _ => {}
        }
    }
}
