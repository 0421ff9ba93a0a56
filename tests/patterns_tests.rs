//! End-to-end agent pipeline shapes: chaining with gates, routing, parallel
//! fan-out, orchestrator-workers over sub-workflows, and an
//! evaluator-optimizer loop. All of them are plain control flow over the
//! workflow context.

use agentflow::providers::HistoryStore;
use agentflow::providers::in_memory::InMemoryHistoryStore;
use agentflow::runtime::registry::ActivityRegistry;
use agentflow::runtime::{self};
use agentflow::{Client, DurableOutput, WorkflowContext, WorkflowRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod common;

async fn start_runtime(
    activities: ActivityRegistry,
    workflows: WorkflowRegistry,
) -> (Arc<runtime::Runtime>, Client) {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = runtime::Runtime::start_with_store(store, activities, workflows).await;
    let client = Client::new(rt.clone());
    (rt, client)
}

// Chaining: each step feeds the next, with a gate that short-circuits the
// chain on a failed check.
#[tokio::test]
async fn prompt_chaining_with_gate() {
    let activities = ActivityRegistry::builder()
        .register("Draft", |topic: String| async move { Ok(format!("draft about {topic}")) })
        .register("CheckLength", |draft: String| async move {
            Ok(if draft.len() > 10 { "pass" } else { "fail" }.to_string())
        })
        .register("Polish", |draft: String| async move { Ok(format!("{draft} (polished)")) })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Chain", |ctx: WorkflowContext, topic: String| async move {
            let draft = ctx
                .call_activity("Draft", topic)
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            let gate = ctx
                .call_activity("CheckLength", draft.clone())
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            if gate != "pass" {
                return Err(format!("gate failed: {gate}"));
            }
            ctx.call_activity("Polish", draft)
                .into_activity()
                .await
                .map_err(|e| e.to_string())
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-chain", "Chain", "rust", std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out.unwrap(), "draft about rust (polished)");
    rt.shutdown().await;
}

// Routing: a classifier activity picks which specialist handles the input;
// the unmatched specialist is never invoked.
#[tokio::test]
async fn routing_by_classifier() {
    let billing_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let general_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let bc = billing_calls.clone();
    let gc = general_calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Classify", |input: String| async move {
            Ok(if input.contains("refund") { "billing" } else { "general" }.to_string())
        })
        .register("Billing", move |input: String| {
            let bc = bc.clone();
            async move {
                bc.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(format!("billing: {input}"))
            }
        })
        .register("General", move |input: String| {
            let gc = gc.clone();
            async move {
                gc.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(format!("general: {input}"))
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Route", |ctx: WorkflowContext, input: String| async move {
            let route = ctx
                .call_activity("Classify", input.clone())
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            let handler = match route.as_str() {
                "billing" => "Billing",
                _ => "General",
            };
            ctx.call_activity(handler, input)
                .into_activity()
                .await
                .map_err(|e| e.to_string())
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let billing = client
        .run_and_wait("inst-route-1", "Route", "I want a refund", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(billing, "billing: I want a refund");
    assert_eq!(billing_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        general_calls.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "unmatched specialist must not run"
    );

    let general = client
        .run_and_wait("inst-route-2", "Route", "hello there", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(general, "general: hello there");
    assert_eq!(billing_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(general_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The history never scheduled the non-selected specialist either.
    let hist = client.read_history("inst-route-1").await;
    assert!(
        !hist
            .iter()
            .any(|r| matches!(&r.event, agentflow::Event::ActivityScheduled { name, .. } if name == "General")),
        "no schedule event for the unmatched specialist"
    );
    rt.shutdown().await;
}

// Parallel fan-out over sections, aggregated in caller order.
#[tokio::test]
async fn parallel_fan_out_aggregates_in_order() {
    let activities = ActivityRegistry::builder()
        .register("Summarize", |section: String| async move {
            // Later sections finish sooner, to exercise order preservation.
            let delay = match section.as_str() {
                "intro" => 60,
                "body" => 30,
                _ => 5,
            };
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            Ok(format!("[{section}]"))
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("FanOut", |ctx: WorkflowContext, _input: String| async move {
            let tasks = ["intro", "body", "outro"]
                .iter()
                .map(|s| ctx.call_activity("Summarize", *s))
                .collect();
            let outs = ctx.wait_for_all(tasks).await;
            let mut parts = Vec::new();
            for o in outs {
                match o {
                    DurableOutput::Activity(Ok(v)) => parts.push(v),
                    DurableOutput::Activity(Err(e)) => return Err(e.to_string()),
                    other => unreachable!("{other:?}"),
                }
            }
            Ok(parts.join(" "))
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-fan", "FanOut", "", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "[intro] [body] [outro]");
    rt.shutdown().await;
}

#[derive(Serialize, Deserialize)]
struct WorkerTask {
    section: String,
}

// Orchestrator-workers: a planner activity decides the fan-out at runtime,
// the parent starts one sub-workflow per planned section and aggregates;
// each child is a durable instance of its own.
#[tokio::test]
async fn orchestrator_workers_over_sub_workflows() {
    let activities = ActivityRegistry::builder()
        .register("Plan", |_: String| async move { Ok("a,b,c".to_string()) })
        .register("Research", |section: String| async move { Ok(format!("notes({section})")) })
        .register("Write", |notes: String| async move { Ok(format!("text<{notes}>")) })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register_typed("Worker", |ctx: WorkflowContext, task: WorkerTask| async move {
            let notes = ctx
                .call_activity("Research", task.section)
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            let text = ctx
                .call_activity("Write", notes)
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            Ok::<String, String>(text)
        })
        .register("Orchestrator", |ctx: WorkflowContext, input: String| async move {
            // Fan-out width comes from a prior activity result, not code.
            let plan = ctx
                .call_activity("Plan", input)
                .into_activity()
                .await
                .map_err(|e| e.to_string())?;
            let tasks = plan
                .split(',')
                .map(|s| {
                    ctx.call_sub_workflow_typed(
                        "Worker",
                        &WorkerTask {
                            section: s.to_string(),
                        },
                    )
                })
                .collect();
            let outs = ctx.wait_for_all(tasks).await;
            let mut parts = Vec::new();
            for o in outs {
                match o {
                    DurableOutput::SubWorkflow(Ok(v)) => parts.push(v),
                    DurableOutput::SubWorkflow(Err(e)) => return Err(e),
                    other => unreachable!("{other:?}"),
                }
            }
            Ok(parts.join("+"))
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-orch", "Orchestrator", "", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "text<notes(a)>+text<notes(b)>+text<notes(c)>");

    // Children are addressable instances with parent-derived ids.
    let instances = client.list_workflows().await;
    let children: Vec<&String> = instances.iter().filter(|i| i.starts_with("inst-orch::sub::")).collect();
    assert_eq!(children.len(), 3, "instances: {instances:?}");
    for child in children {
        let desc = client.get_workflow_descriptor(child).await.unwrap();
        assert_eq!(desc.name, "Worker");
        assert_eq!(desc.parent_instance.as_deref(), Some("inst-orch"));
    }
    rt.shutdown().await;
}

// Evaluator-optimizer: generate, score, and loop until the evaluator accepts
// or the round budget runs out. With a budget of 2 and acceptance on the
// second candidate, each activity runs exactly twice despite all the replay
// passes in between.
#[tokio::test]
async fn evaluator_optimizer_loop_converges() {
    let generate_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let evaluate_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let gc = generate_calls.clone();
    let ec = evaluate_calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Generate", move |attempt: String| {
            let gc = gc.clone();
            async move {
                gc.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(format!("v{attempt}"))
            }
        })
        .register("Evaluate", move |candidate: String| {
            let ec = ec.clone();
            async move {
                ec.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                // Accepts from the second candidate on.
                let n: u32 = candidate.trim_start_matches('v').parse().unwrap_or(0);
                Ok(if n >= 2 { "accept" } else { "revise" }.to_string())
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Refine", |ctx: WorkflowContext, _input: String| async move {
            let max_rounds = 2u32;
            let mut candidate = String::new();
            for round in 1..=max_rounds {
                candidate = ctx
                    .call_activity("Generate", round.to_string())
                    .into_activity()
                    .await
                    .map_err(|e| e.to_string())?;
                let verdict = ctx
                    .call_activity("Evaluate", candidate.clone())
                    .into_activity()
                    .await
                    .map_err(|e| e.to_string())?;
                if verdict == "accept" {
                    return Ok(format!("{candidate} after {round} rounds"));
                }
                ctx.trace_debug(format!("round {round} rejected"));
            }
            Err(format!("no acceptable candidate in {max_rounds} rounds, last: {candidate}"))
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-refine", "Refine", "", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "v2 after 2 rounds");
    // Replay never re-executes completed activities.
    assert_eq!(generate_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(evaluate_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    rt.shutdown().await;
}

// A failing child propagates its error to the parent as a catchable result.
#[tokio::test]
async fn sub_workflow_failure_propagates_to_parent() {
    let activities = ActivityRegistry::builder().build();
    let workflows = WorkflowRegistry::builder()
        .register("BadChild", |_ctx: WorkflowContext, _input| async move {
            Err::<String, String>("child exploded".to_string())
        })
        .register("Parent", |ctx: WorkflowContext, _input| async move {
            match ctx.call_sub_workflow("BadChild", "").into_sub_workflow().await {
                Ok(v) => Ok(v),
                Err(e) => Ok(format!("handled: {e}")),
            }
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-badchild", "Parent", "", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "handled: child exploded");
    rt.shutdown().await;
}

// A durable timer racing real work: the timeout arm wins when the work is
// slower than the deadline.
#[tokio::test]
async fn timer_race_deadline_wins() {
    let activities = ActivityRegistry::builder()
        .register("Slow", |_: String| async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            Ok("late".to_string())
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("WithDeadline", |ctx: WorkflowContext, _input: String| async move {
            let work = ctx.call_activity("Slow", "");
            let deadline = ctx.create_timer(std::time::Duration::from_millis(40));
            let (idx, _) = ctx.wait_for_any(vec![work, deadline]).await;
            match idx {
                0 => Ok("work".to_string()),
                _ => Ok("timeout".to_string()),
            }
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out = client
        .run_and_wait("inst-deadline", "WithDeadline", "", std::time::Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "timeout");
    rt.shutdown().await;
}

// Typed client round trip through a typed workflow registration.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Report {
    title: String,
    sections: u32,
}

#[tokio::test]
async fn typed_client_round_trip() {
    let activities = ActivityRegistry::builder().build();
    let workflows = WorkflowRegistry::builder()
        .register_typed("MakeReport", |_ctx: WorkflowContext, title: String| async move {
            Ok::<Report, String>(Report { title, sections: 2 })
        })
        .build();

    let (rt, client) = start_runtime(activities, workflows).await;
    let out: Result<Report, String> = client
        .run_and_wait_typed(
            "inst-typed",
            "MakeReport",
            "weekly".to_string(),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(
        out.unwrap(),
        Report {
            title: "weekly".to_string(),
            sections: 2
        }
    );
    rt.shutdown().await;
}
