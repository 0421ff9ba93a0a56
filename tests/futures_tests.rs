use agentflow::providers::HistoryStore;
use agentflow::providers::in_memory::InMemoryHistoryStore;
use agentflow::runtime::registry::ActivityRegistry;
use agentflow::runtime::{self};
use agentflow::{DurableOutput, Event, WorkflowContext, WorkflowRegistry, run_turn};
use std::sync::Arc;

mod common;

// wait_for_all returns outputs in caller order even when completions landed
// in a different order in history.
#[test]
fn join_outputs_in_caller_order() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "B".into(),
            input: String::new(),
        },
        // B finished first.
        Event::ActivityCompleted { id: 2, result: "b".into() },
        Event::ActivityCompleted { id: 1, result: "a".into() },
    ];
    let workflow = |ctx: WorkflowContext| async move {
        let a = ctx.call_activity("A", "");
        let b = ctx.call_activity("B", "");
        ctx.wait_for_all(vec![a, b]).await
    };

    let turn = run_turn(history, workflow);
    let outs = turn.output.unwrap();
    match (&outs[0], &outs[1]) {
        (DurableOutput::Activity(Ok(a)), DurableOutput::Activity(Ok(b))) => {
            assert_eq!(a, "a");
            assert_eq!(b, "b");
        }
        other => panic!("unexpected outputs: {other:?}"),
    }
}

// wait_for_any picks the child whose completion appears earliest in history,
// regardless of caller order.
#[test]
fn select_winner_is_earliest_completion_in_history() {
    let history = vec![
        Event::TimerScheduled { id: 1, fire_at_ms: 100 },
        Event::TimerScheduled { id: 2, fire_at_ms: 50 },
        Event::TimerFired { id: 2, fire_at_ms: 50 },
        Event::TimerFired { id: 1, fire_at_ms: 100 },
    ];
    let workflow = |ctx: WorkflowContext| async move {
        let slow = ctx.create_timer(std::time::Duration::from_millis(100));
        let fast = ctx.create_timer(std::time::Duration::from_millis(50));
        let (idx, out) = ctx.wait_for_any(vec![slow, fast]).await;
        assert!(matches!(out, DurableOutput::Timer));
        idx
    };

    let turn = run_turn(history, workflow);
    assert_eq!(turn.output.unwrap(), 1, "second child fired first");
}

// Replay stability: the same select winner is chosen from the same history,
// even though both completions are now present.
#[test]
fn select_winner_stable_across_replays() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::TimerScheduled { id: 2, fire_at_ms: 10 },
        Event::ActivityCompleted { id: 1, result: "a".into() },
        Event::TimerFired { id: 2, fire_at_ms: 10 },
    ];
    let workflow = |ctx: WorkflowContext| async move {
        let a = ctx.call_activity("A", "");
        let t = ctx.create_timer(std::time::Duration::from_millis(10));
        let (idx, _) = ctx.wait_for_any(vec![a, t]).await;
        idx
    };
    for _ in 0..3 {
        let turn = run_turn(history.clone(), workflow);
        assert_eq!(turn.output.unwrap(), 0);
    }
}

// Losers of a race stay pending; their completions are still recorded and a
// completed instance ends up with a coherent history.
#[tokio::test]
async fn select_loser_completion_still_recorded() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let activities = ActivityRegistry::builder()
        .register("Quick", |_: String| async move { Ok("q".to_string()) })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Race", |ctx: WorkflowContext, _input| async move {
            let work = ctx.call_activity("Quick", "");
            let deadline = ctx.create_timer(std::time::Duration::from_millis(50));
            let (idx, out) = ctx.wait_for_any(vec![work, deadline]).await;
            match (idx, out) {
                (0, DurableOutput::Activity(Ok(v))) => Ok(v),
                (1, DurableOutput::Timer) => Err("deadline".to_string()),
                other => unreachable!("unexpected race outcome: {other:?}"),
            }
        })
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, workflows).await;
    let h = rt.clone().start_workflow("inst-race", "Race", "").await.unwrap();
    let (_hist, out) = h.await.unwrap();
    assert_eq!(out.unwrap(), "q");

    // The losing timer may fire after the terminal event; give it a moment
    // and verify it did not corrupt the finished history.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    let events = store.read_events("inst-race").await;
    assert!(events.last().unwrap().is_terminal(), "history ends at the terminal event");
    rt.clone().shutdown().await;
}

// After a race, into_rest hands back the losers with the winner's slot
// empty; a loser may still be awaited once its completion is recorded.
#[test]
fn select_rest_empties_winner_slot_and_losers_resolve_later() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "x".into(),
        },
        Event::TimerScheduled { id: 2, fire_at_ms: 0 },
        Event::ActivityCompleted { id: 1, result: "fast".into() },
        Event::TimerFired { id: 2, fire_at_ms: 0 },
    ];
    let workflow = |ctx: WorkflowContext| async move {
        let a = ctx.call_activity("A", "x");
        let t = ctx.create_timer(std::time::Duration::from_millis(5));
        let mut race = ctx.wait_for_any(vec![a, t]);
        let (idx, out) = (&mut race).await;
        let first = match out {
            DurableOutput::Activity(Ok(v)) => v,
            other => panic!("unexpected winner output: {other:?}"),
        };
        let rest = race.into_rest();
        assert!(rest[idx].is_none(), "winner slot must be empty");
        let loser = rest.into_iter().flatten().next().unwrap();
        loser.into_timer().await;
        format!("{first}:timer")
    };

    let turn = run_turn(history, workflow);
    assert!(turn.nondeterminism.is_none());
    assert_eq!(turn.output.unwrap(), "fast:timer");
}

// Typed decode failures at the workflow boundary are permanent activity
// errors, not panics.
#[test]
fn typed_output_decode_failure_is_permanent() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "not-a-number".into(),
        },
    ];
    let workflow = |ctx: WorkflowContext| async move {
        ctx.call_activity("A", "")
            .into_activity_typed::<u32>()
            .await
    };
    let turn = run_turn(history, workflow);
    let err = turn.output.unwrap().unwrap_err();
    assert!(!err.is_retryable(), "decode failure must be permanent");
}

// Sub-workflow scheduling records a deterministic child suffix derived from
// the correlation id.
#[test]
fn sub_workflow_child_suffix_is_deterministic() {
    let workflow = |ctx: WorkflowContext| async move {
        ctx.call_sub_workflow("Child", "x").into_sub_workflow().await
    };
    let turn = run_turn::<Result<String, String>, _>(Vec::new(), workflow);
    match &turn.history[0] {
        Event::SubWorkflowScheduled { id, instance, name, .. } => {
            assert_eq!(name, "Child");
            assert_eq!(instance, &format!("sub::{id}"));
        }
        other => panic!("expected SubWorkflowScheduled, got {other:?}"),
    }
    // Replay adopts the recorded suffix rather than re-deriving it.
    let turn2 = run_turn::<Result<String, String>, _>(turn.history.clone(), workflow);
    assert!(turn2.actions.is_empty());
}

// Awaiting the same logical future across passes claims schedule events in
// program order, so interleaved kinds stay matched to their own claims.
#[test]
fn interleaved_kinds_claim_in_program_order() {
    let workflow = |ctx: WorkflowContext| async move {
        let t = ctx.create_timer(std::time::Duration::from_millis(5));
        let a = ctx.call_activity("A", "in");
        let outs = ctx.wait_for_all(vec![t, a]).await;
        match &outs[1] {
            DurableOutput::Activity(Ok(v)) => v.clone(),
            other => unreachable!("{other:?}"),
        }
    };

    let first = run_turn::<String, _>(Vec::new(), workflow);
    assert!(matches!(first.history[0], Event::TimerScheduled { id: 1, .. }));
    assert!(matches!(
        &first.history[1],
        Event::ActivityScheduled { id: 2, name, .. } if name == "A"
    ));
    assert_eq!(first.actions.len(), 2);
}
