//! History integrity checks used when loading an instance and in tests.

use crate::Event;
use std::collections::{HashMap, HashSet};

/// Validate structural invariants of a history log: the first event is
/// `WorkflowStarted`, scheduling ids are unique, every completion correlates
/// to a scheduling event of the same kind, each id completes at most once,
/// and nothing follows a terminal event. Returns the first violation found.
pub fn verify_history_invariants(history: &[Event]) -> Option<String> {
    if let Some(first) = history.first() {
        if !matches!(first, Event::WorkflowStarted { .. }) {
            return Some("history does not begin with WorkflowStarted".to_string());
        }
    }

    let mut scheduled: HashMap<u64, &'static str> = HashMap::new();
    let mut completed: HashSet<u64> = HashSet::new();
    let mut terminal_seen = false;

    for e in history {
        if terminal_seen {
            return Some(format!("event after terminal: {e:?}"));
        }
        match e {
            Event::ActivityScheduled { id, .. } => {
                if scheduled.insert(*id, "activity").is_some() {
                    return Some(format!("duplicate scheduling id {id}"));
                }
            }
            Event::TimerScheduled { id, .. } => {
                if scheduled.insert(*id, "timer").is_some() {
                    return Some(format!("duplicate scheduling id {id}"));
                }
            }
            Event::SubWorkflowScheduled { id, .. } => {
                if scheduled.insert(*id, "sub-workflow").is_some() {
                    return Some(format!("duplicate scheduling id {id}"));
                }
            }
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => {
                if let Some(err) = check_completion(&scheduled, &mut completed, *id, "activity") {
                    return Some(err);
                }
            }
            Event::TimerFired { id, .. } => {
                if let Some(err) = check_completion(&scheduled, &mut completed, *id, "timer") {
                    return Some(err);
                }
            }
            Event::SubWorkflowCompleted { id, .. } | Event::SubWorkflowFailed { id, .. } => {
                if let Some(err) = check_completion(&scheduled, &mut completed, *id, "sub-workflow") {
                    return Some(err);
                }
            }
            Event::WorkflowStarted { .. } => {}
            Event::WorkflowCompleted { .. } | Event::WorkflowFailed { .. } | Event::WorkflowTerminated { .. } => {
                terminal_seen = true;
            }
        }
    }
    None
}

fn check_completion(
    scheduled: &HashMap<u64, &'static str>,
    completed: &mut HashSet<u64>,
    id: u64,
    kind: &'static str,
) -> Option<String> {
    match scheduled.get(&id) {
        Some(k) if *k == kind => {}
        Some(k) => return Some(format!("completion kind mismatch for id {id}: scheduled {k}, completed {kind}")),
        None => return Some(format!("completion without scheduling event: id {id} ({kind})")),
    }
    if !completed.insert(id) {
        return Some(format!("duplicate completion for id {id}"));
    }
    None
}
