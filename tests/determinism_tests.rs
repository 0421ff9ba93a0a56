use agentflow::providers::HistoryStore;
use agentflow::providers::fs::FsHistoryStore;
use agentflow::providers::in_memory::InMemoryHistoryStore;
use agentflow::runtime::registry::ActivityRegistry;
use agentflow::runtime::{self};
use agentflow::{DurableOutput, Event, WorkflowContext, WorkflowRegistry, run_turn};
use std::sync::Arc;

mod common;

fn mixed_workflow(ctx: WorkflowContext) -> impl std::future::Future<Output = Result<String, String>> {
    async move {
        let f_a = ctx.call_activity("A", "1");
        let f_t = ctx.create_timer(std::time::Duration::from_millis(5));
        let outs = ctx.wait_for_all(vec![f_a, f_t]).await;
        let a = match &outs[0] {
            DurableOutput::Activity(Ok(v)) => v.clone(),
            other => unreachable!("A must be an activity result, got {other:?}"),
        };
        assert!(matches!(outs[1], DurableOutput::Timer));
        let b = ctx
            .call_activity("B", a.clone())
            .into_activity()
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("a={a}, b={b}"))
    }
}

async fn workflow_completes_and_replays_deterministically_with(store: Arc<dyn HistoryStore>) {
    let activities = ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().unwrap_or(0).saturating_add(1).to_string())
        })
        .register("B", |input: String| async move { Ok(format!("{input}!")) })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("DeterministicWorkflow", |ctx, _input| mixed_workflow(ctx))
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, workflows).await;
    let handle = rt
        .clone()
        .start_workflow("inst-det-1", "DeterministicWorkflow", "")
        .await;
    let (final_history, output) = handle.unwrap().await.unwrap();
    let output = output.unwrap();
    assert_eq!(output, "a=2, b=2!");

    // WorkflowStarted + 3 schedule/complete pairs + terminal.
    assert_eq!(final_history.len(), 8, "unexpected history: {final_history:#?}");
    assert!(matches!(final_history[0], Event::WorkflowStarted { .. }));
    assert!(final_history.last().unwrap().is_terminal());

    // Replaying the final history reproduces the output with no new actions.
    let turn = run_turn(final_history, mixed_workflow);
    assert!(turn.actions.is_empty(), "replay must not schedule new work");
    assert!(turn.nondeterminism.is_none());
    assert_eq!(turn.output.unwrap(), Ok(output));

    rt.clone().shutdown().await;
}

#[tokio::test]
async fn workflow_completes_and_replays_deterministically_in_memory() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    workflow_completes_and_replays_deterministically_with(store).await;
}

#[tokio::test]
async fn workflow_completes_and_replays_deterministically_fs() {
    let td = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(td.path(), true));
    workflow_completes_and_replays_deterministically_with(store).await;
}

// Correlation ids restart from max(history)+1 on every pass, so replays and
// live passes allocate identically.
#[test]
fn correlation_ids_deterministic_across_passes() {
    let workflow = |ctx: WorkflowContext| async move {
        let a = ctx.call_activity("A", "").into_activity().await;
        let _b = ctx.call_activity("B", "").into_activity().await;
        a
    };

    let first = run_turn::<Result<String, _>, _>(Vec::new(), workflow);
    let first_id = match &first.history[0] {
        Event::ActivityScheduled { id, .. } => *id,
        other => panic!("expected ActivityScheduled, got {other:?}"),
    };
    assert_eq!(first_id, 1);

    // Complete A; the next pass must allocate id 2 for B, not re-allocate 1.
    let mut history = first.history;
    history.push(Event::ActivityCompleted {
        id: first_id,
        result: "a".into(),
    });
    let second = run_turn::<Result<String, _>, _>(history, workflow);
    let b_id = second
        .history
        .iter()
        .find_map(|e| match e {
            Event::ActivityScheduled { id, name, .. } if name == "B" => Some(*id),
            _ => None,
        })
        .expect("B scheduled in second pass");
    assert_eq!(b_id, 2);
}

// Buffered logs: emitted on passes that make progress, dropped on pure
// replay passes so a message never fires twice.
#[test]
fn workflow_logs_are_replay_safe() {
    let workflow = |ctx: WorkflowContext| async move {
        ctx.trace_info("starting");
        let r = ctx.call_activity("A", "").into_activity().await;
        ctx.trace_info("finished");
        r
    };

    // First pass schedules A: progress, so the buffered message surfaces.
    let first = run_turn::<Result<String, _>, _>(Vec::new(), workflow);
    assert_eq!(first.logs.len(), 1);
    assert_eq!(first.logs[0].1, "starting");

    // Suspended replay of the same history: no progress, no logs.
    let replay = run_turn::<Result<String, _>, _>(first.history.clone(), workflow);
    assert!(replay.logs.is_empty(), "pure replay must stay silent");

    // Completion pass: progress again, and only the buffered messages from
    // this pass are flushed.
    let mut history = first.history;
    history.push(Event::ActivityCompleted { id: 1, result: "x".into() });
    let done = run_turn::<Result<String, _>, _>(history, workflow);
    assert!(done.output.is_some());
    let messages: Vec<&str> = done.logs.iter().map(|(_, m)| m.as_str()).collect();
    assert_eq!(messages, vec!["starting", "finished"]);
}

// A failed activity surfaces to the workflow as a resolved Err it may catch;
// replay of the failure is just as deterministic as success.
#[test]
fn activity_failure_replays_deterministically() {
    let workflow = |ctx: WorkflowContext| async move {
        match ctx.call_activity("Flaky", "x").into_activity().await {
            Ok(v) => Ok(format!("ok:{v}")),
            Err(e) => Ok(format!("caught:{}", e.message)),
        }
    };

    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "Flaky".into(),
            input: "x".into(),
        },
        Event::ActivityFailed {
            id: 1,
            error: agentflow::ActivityError::permanent("boom"),
        },
    ];
    let turn = run_turn::<Result<String, String>, _>(history, workflow);
    assert!(turn.actions.is_empty());
    assert_eq!(turn.output.unwrap(), Ok("caught:boom".to_string()));
}
