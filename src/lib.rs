//! Durable, replay-driven workflow engine for agent pipelines.
//!
//! Workflow functions are ordinary async Rust; every side effect goes through
//! the [`WorkflowContext`], which records append-only [`Event`]s and replays
//! them so a function can be re-run from the start after a crash without
//! re-executing completed work. On top of that single abstraction, chaining,
//! routing, parallel fan-out, orchestrator-workers, and evaluator-optimizer
//! loops are all plain control flow.
//!
//! The crate provides:
//!
//! - Public data model: [`Event`], [`Action`], [`ActivityError`]
//! - Single-turn replay driver: [`run_turn`], [`run_turn_with`], and [`Executor`]
//! - A [`WorkflowContext`] with futures for activities, timers, and
//!   sub-workflows, composable via `wait_for_all`/`wait_for_any`
//! - A hosting `runtime::Runtime` with durable providers and a [`Client`]
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use client::Client;
pub use runtime::{WorkflowDescriptor, WorkflowHandler, WorkflowRegistry, WorkflowRegistryBuilder, WorkflowStatus};

use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// Internal JSON codec for typed I/O (kept private; the public API stays
// string-based at the history boundary). A bare JSON string is passed through
// raw so string-typed payloads compose without double-encoding.
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                // Fallback: treat the raw string as a JSON string value
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

/// Classification of an activity failure, consumed by the executor's retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityErrorKind {
    /// May succeed on retry: rate limits, timeouts, connection resets.
    Transient,
    /// Will not succeed on retry: bad input, missing registration, logic errors.
    Permanent,
}

/// Error returned by an activity handler.
///
/// Only `Transient` errors consume retry budget. Once the budget is exhausted
/// (or the error is `Permanent`) the failure is recorded in history and
/// surfaces to the workflow as a resolved `Err` it may catch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityError {
    pub kind: ActivityErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ActivityErrorKind::Transient
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ActivityErrorKind::Transient => write!(f, "transient: {}", self.message),
            ActivityErrorKind::Permanent => write!(f, "permanent: {}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

/// Plain string errors from activity code are permanent; retrying is opt-in
/// via `ActivityError::transient`.
impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        Self::permanent(message)
    }
}

impl From<&str> for ActivityError {
    fn from(message: &str) -> Self {
        Self::permanent(message.to_string())
    }
}

/// Append-only workflow history entries persisted by a provider and consumed
/// during replay. Correlation ids pair each scheduling event with its
/// eventual completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was created and started by definition name with input.
    /// Parent linkage is present when this instance is a sub-workflow.
    WorkflowStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Activity was scheduled with a correlation id and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed after its retry policy was exhausted (or permanently).
    ActivityFailed { id: u64, error: ActivityError },

    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerScheduled { id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Sub-workflow was scheduled with a deterministic child instance id.
    SubWorkflowScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    /// Sub-workflow completed and returned a result to the parent.
    SubWorkflowCompleted { id: u64, result: String },
    /// Sub-workflow failed and returned an error to the parent.
    SubWorkflowFailed { id: u64, error: String },

    /// Terminal: workflow function returned `Ok`.
    WorkflowCompleted { output: String },
    /// Terminal: workflow function returned `Err`, or replay detected
    /// nondeterministic workflow code.
    WorkflowFailed { error: String },
    /// Terminal: the instance was terminated by an external request.
    WorkflowTerminated { reason: String },
}

impl Event {
    /// Correlation id of a scheduling event, if this is one.
    pub(crate) fn scheduling_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::TimerScheduled { id, .. }
            | Event::SubWorkflowScheduled { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerScheduled { id, .. }
            | Event::TimerFired { id, .. }
            | Event::SubWorkflowScheduled { id, .. }
            | Event::SubWorkflowCompleted { id, .. }
            | Event::SubWorkflowFailed { id, .. } => Some(*id),
            Event::WorkflowStarted { .. }
            | Event::WorkflowCompleted { .. }
            | Event::WorkflowFailed { .. }
            | Event::WorkflowTerminated { .. } => None,
        }
    }

    /// Short human label used in nondeterminism diagnostics.
    pub(crate) fn describe(&self) -> String {
        match self {
            Event::ActivityScheduled { name, input, .. } => {
                format!("ActivityScheduled('{name}', '{input}')")
            }
            Event::TimerScheduled { id, .. } => format!("TimerScheduled(id={id})"),
            Event::SubWorkflowScheduled { name, input, .. } => {
                format!("SubWorkflowScheduled('{name}', '{input}')")
            }
            other => format!("{other:?}"),
        }
    }

    /// True for `WorkflowCompleted`, `WorkflowFailed`, and `WorkflowTerminated`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::WorkflowCompleted { .. } | Event::WorkflowFailed { .. } | Event::WorkflowTerminated { .. }
        )
    }
}

/// Declarative decisions produced by one replay pass. Replay itself has no
/// side effects beyond the in-pass history; the host materializes these into
/// dispatched work and corresponding completion `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dispatch an activity invocation to the worker pool.
    CallActivity { id: u64, name: String, input: String },
    /// Arm a durable timer firing at the recorded absolute time.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// Start a child workflow instance; its result routes back by `id`.
    StartSubWorkflow {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    actions: Vec<Action>,

    /// Next fresh correlation id, always `max id in history + 1` so every
    /// replay allocates the same ids in the same order.
    next_correlation_id: u64,

    /// Scheduling events already matched by a future during this pass.
    pub(crate) claimed_schedule_ids: HashSet<u64>,
    /// First detected replay mismatch; fatal for the instance.
    pub(crate) nondeterminism: Option<String>,

    turn_index: u64,
    /// Flipped on when a decision is recorded so only progress turns log.
    progress_this_poll: bool,
    log_buffer: Vec<(LogLevel, String)>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let max_id = history.iter().filter_map(|e| e.correlation_id()).max().unwrap_or(0);
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            claimed_schedule_ids: HashSet::new(),
            nondeterminism: None,
            turn_index: 0,
            progress_this_poll: false,
            log_buffer: Vec::new(),
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.progress_this_poll = true;
        self.actions.push(a);
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    pub(crate) fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// User-facing handle for scheduling durable work from a workflow function.
///
/// The context is rebuilt from scratch on every replay pass; all of its state
/// derives from the event history plus the workflow function's own control
/// flow, which is why that control flow must be deterministic.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    /// Construct a new context over an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Typed variant that serializes the input; pair with
    /// `DurableFuture::into_activity_typed` for the output.
    pub fn call_activity_typed<In: serde::Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let payload = codec::encode(input).expect("encode activity input");
        self.call_activity(name, payload)
    }

    /// Create a durable timer that fires after `delay`.
    pub fn create_timer(&self, delay: std::time::Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay.as_millis() as u64)
    }

    /// Schedule a sub-workflow by name; the child instance id is derived
    /// deterministically from this instance and the correlation id.
    pub fn call_sub_workflow(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::sub_workflow(self.clone(), name.into(), input.into())
    }

    pub fn call_sub_workflow_typed<In: serde::Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let payload = codec::encode(input).expect("encode sub-workflow input");
        self.call_sub_workflow(name, payload)
    }

    /// Suspend until every listed future has a terminal event. Outputs come
    /// back in caller order, not completion order.
    pub fn wait_for_all(&self, tasks: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(self.clone(), tasks)
    }

    /// Suspend until the first listed future resolves, returning
    /// `(winner_index, output)`. Losers are left pending: they may be awaited
    /// again later or dropped; their completions are still recorded.
    pub fn wait_for_any(&self, tasks: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), tasks)
    }

    /// Zero-based replay pass counter assigned by the host, for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Buffer a log message. The host flushes the buffer only on passes that
    /// made progress, so replayed passes stay silent.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        self.inner.lock().unwrap().log_buffer.push((level, message.into()));
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(LogLevel::Debug, message);
    }
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    // `fut` is a stack local that is never moved while pinned here.
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Result of one replay pass over a workflow function.
#[derive(Debug)]
pub struct TurnResult<O> {
    /// History including any `*Scheduled` events appended during the pass.
    pub history: Vec<Event>,
    /// New work requested by this pass, to be materialized by the host.
    pub actions: Vec<Action>,
    /// Workflow log messages buffered during the pass (empty on pure replays).
    pub logs: Vec<(LogLevel, String)>,
    /// `Some` when the workflow function ran to completion this pass.
    pub output: Option<O>,
    /// Fatal replay mismatch, if one was detected.
    pub nondeterminism: Option<String>,
    /// Scheduling-event ids matched by futures during the pass.
    pub claimed_schedule_ids: HashSet<u64>,
}

/// Replay the workflow function once against `history`, producing updated
/// history, requested actions, buffered logs, and an optional output.
///
/// A `Poll::Pending` from the outermost future *is* the suspension point:
/// nothing past the first unresolved primitive has executed.
pub fn run_turn<O, F>(history: Vec<Event>, workflow: impl Fn(WorkflowContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, workflow)
}

/// Same as [`run_turn`] but tags the context with a host-supplied pass index
/// for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    workflow: impl Fn(WorkflowContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = WorkflowContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = workflow(ctx.clone());
    let polled = poll_once(&mut fut);

    let output = match polled {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().progress_this_poll = true;
            Some(out)
        }
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let logs = if ctx.inner.lock().unwrap().progress_this_poll {
        ctx.take_log_buffer()
    } else {
        let _ = ctx.take_log_buffer();
        Vec::new()
    };
    let mut inner = ctx.inner.lock().unwrap();
    let history = std::mem::take(&mut inner.history);
    let claimed = std::mem::take(&mut inner.claimed_schedule_ids);
    let mut nondeterminism = inner.nondeterminism.take();
    drop(inner);

    // A completed pass must have revisited every scheduling event in history;
    // leftovers mean the code no longer matches what was recorded.
    if nondeterminism.is_none() && output.is_some() {
        if let Some(orphan) = history
            .iter()
            .find(|e| e.scheduling_id().map(|id| !claimed.contains(&id)).unwrap_or(false))
        {
            nondeterminism = Some(format!(
                "workflow completed without revisiting recorded {}",
                orphan.describe()
            ));
        }
    }

    TurnResult {
        history,
        actions,
        logs,
        output: if nondeterminism.is_some() { None } else { output },
        nondeterminism,
        claimed_schedule_ids: claimed,
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drive a workflow by alternately replaying one turn and invoking
    /// `execute_actions` to materialize requested actions into history, until
    /// the workflow completes. Panics on detected nondeterminism; the runtime
    /// handles that case gracefully instead.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        workflow: impl Fn(WorkflowContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        let mut turn_index = 0u64;
        loop {
            let turn = run_turn_with(history, turn_index, &workflow);
            if let Some(err) = turn.nondeterminism {
                panic!("nondeterministic replay: {err}");
            }
            history = turn.history;
            if let Some(out) = turn.output {
                return (history, out);
            }
            execute_actions(turn.actions, &mut history);
            turn_index += 1;
        }
    }
}
