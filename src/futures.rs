//! Durable futures for activities, timers, and sub-workflows.
//!
//! Each `DurableFuture` claims the next unclaimed scheduling event in history
//! order when first polled. On a first execution there is no such event, so
//! the future appends one and records an [`Action`]; on replay it adopts the
//! recorded event, and a kind/name/input mismatch is flagged as
//! nondeterministic workflow code. Completions resolve by correlation id
//! wherever they sit in history, so out-of-arrival-order completions never
//! corrupt replay.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, ActivityError, Event, WorkflowContext};

/// Output of a [`DurableFuture`] when awaited via unified composition.
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, ActivityError>),
    Timer,
    SubWorkflow(Result<String, String>),
}

/// A unified future for activities, timers, and sub-workflows carrying a
/// correlation id. Composes with `wait_for_all`/`wait_for_any`.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        claimed: Cell<Option<u64>>,
        ctx: WorkflowContext,
    },
    Timer {
        delay_ms: u64,
        claimed: Cell<Option<u64>>,
        ctx: WorkflowContext,
    },
    SubWorkflow {
        name: String,
        input: String,
        instance: RefCell<String>,
        claimed: Cell<Option<u64>>,
        ctx: WorkflowContext,
    },
}

impl DurableFuture {
    pub(crate) fn activity(ctx: WorkflowContext, name: String, input: String) -> Self {
        Self(Kind::Activity {
            name,
            input,
            claimed: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn timer(ctx: WorkflowContext, delay_ms: u64) -> Self {
        Self(Kind::Timer {
            delay_ms,
            claimed: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn sub_workflow(ctx: WorkflowContext, name: String, input: String) -> Self {
        Self(Kind::SubWorkflow {
            name,
            input,
            instance: RefCell::new(String::new()),
            claimed: Cell::new(None),
            ctx,
        })
    }

    fn ctx(&self) -> &WorkflowContext {
        match &self.0 {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::SubWorkflow { ctx, .. } => ctx,
        }
    }

    fn claimed_id(&self) -> Option<u64> {
        match &self.0 {
            Kind::Activity { claimed, .. } | Kind::Timer { claimed, .. } | Kind::SubWorkflow { claimed, .. } => {
                claimed.get()
            }
        }
    }

    /// Index of this future's completion event in history, if present.
    /// Used by `SelectFuture` to pick a deterministic winner.
    fn completion_index(&self, history: &[Event]) -> Option<usize> {
        let id = self.claimed_id()?;
        history.iter().position(|e| match e {
            Event::ActivityCompleted { id: cid, .. }
            | Event::ActivityFailed { id: cid, .. }
            | Event::TimerFired { id: cid, .. }
            | Event::SubWorkflowCompleted { id: cid, .. }
            | Event::SubWorkflowFailed { id: cid, .. } => *cid == id,
            _ => false,
        })
    }
}

/// What a future expects the next unclaimed scheduling event to be.
enum Expect<'a> {
    Activity { name: &'a str, input: &'a str },
    Timer,
    SubWorkflow { name: &'a str, input: &'a str },
}

impl Expect<'_> {
    fn describe(&self) -> String {
        match self {
            Expect::Activity { name, input } => format!("ActivityScheduled('{name}', '{input}')"),
            Expect::Timer => "TimerScheduled".to_string(),
            Expect::SubWorkflow { name, input } => format!("SubWorkflowScheduled('{name}', '{input}')"),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Expect::Activity { name, input }, Event::ActivityScheduled { name: n, input: inp, .. }) => {
                n == name && inp == input
            }
            (Expect::Timer, Event::TimerScheduled { .. }) => true,
            (
                Expect::SubWorkflow { name, input },
                Event::SubWorkflowScheduled { name: n, input: inp, .. },
            ) => n == name && inp == input,
            _ => false,
        }
    }
}

/// Claim the next unclaimed scheduling event for `expect`, or allocate a
/// fresh one on first execution. Returns `None` after recording a
/// nondeterminism error, in which case the caller must stay `Pending`.
fn claim_or_allocate(
    inner: &mut crate::CtxInner,
    expect: Expect<'_>,
    allocate: impl FnOnce(&mut crate::CtxInner, u64),
) -> Option<u64> {
    let next_unclaimed = inner
        .history
        .iter()
        .find(|e| {
            e.scheduling_id()
                .map(|id| !inner.claimed_schedule_ids.contains(&id))
                .unwrap_or(false)
        })
        .cloned();

    let id = match next_unclaimed {
        Some(event) => {
            if !expect.matches(&event) {
                inner.nondeterminism = Some(format!(
                    "schedule order mismatch: recorded {} but workflow requested {}",
                    event.describe(),
                    expect.describe()
                ));
                return None;
            }
            event.scheduling_id().unwrap_or(0)
        }
        None => {
            let id = inner.next_id();
            allocate(inner, id);
            id
        }
    };
    inner.claimed_schedule_ids.insert(id);
    Some(id)
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // DurableFuture is Unpin (asserted below), so projecting is safe.
        let this = Pin::into_inner(self);

        match &this.0 {
            Kind::Activity {
                name,
                input,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    let expect = Expect::Activity { name, input };
                    let id = match claim_or_allocate(&mut inner, expect, |inner, id| {
                        inner.history.push(Event::ActivityScheduled {
                            id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::CallActivity {
                            id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }) {
                        Some(id) => id,
                        None => return Poll::Pending,
                    };
                    claimed.set(Some(id));
                }
                let our_id = claimed.get().unwrap_or(0);
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted { id, result } if *id == our_id => Some(Ok(result.clone())),
                    Event::ActivityFailed { id, error } if *id == our_id => Some(Err(error.clone())),
                    _ => None,
                });
                match completion {
                    Some(result) => Poll::Ready(DurableOutput::Activity(result)),
                    None => Poll::Pending,
                }
            }
            Kind::Timer { delay_ms, claimed, ctx } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    let fire_at_ms = inner.now_ms().saturating_add(*delay_ms);
                    let id = match claim_or_allocate(&mut inner, Expect::Timer, |inner, id| {
                        inner.history.push(Event::TimerScheduled { id, fire_at_ms });
                        inner.record_action(Action::CreateTimer { id, fire_at_ms });
                    }) {
                        Some(id) => id,
                        None => return Poll::Pending,
                    };
                    claimed.set(Some(id));
                }
                let our_id = claimed.get().unwrap_or(0);
                let fired = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerFired { id, .. } if *id == our_id));
                if fired {
                    Poll::Ready(DurableOutput::Timer)
                } else {
                    Poll::Pending
                }
            }
            Kind::SubWorkflow {
                name,
                input,
                instance,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    // Adopt the recorded child instance name on replay so the
                    // runtime routes to the same child across recoveries.
                    let expect = Expect::SubWorkflow { name, input };
                    let next_unclaimed = inner.history.iter().find_map(|e| match e {
                        Event::SubWorkflowScheduled { id, instance: inst, .. }
                            if !inner.claimed_schedule_ids.contains(id) =>
                        {
                            Some(inst.clone())
                        }
                        _ => None,
                    });
                    let id = match claim_or_allocate(&mut inner, expect, |inner, id| {
                        let child_instance = format!("sub::{id}");
                        inner.history.push(Event::SubWorkflowScheduled {
                            id,
                            name: name.clone(),
                            instance: child_instance.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::StartSubWorkflow {
                            id,
                            name: name.clone(),
                            instance: child_instance,
                            input: input.clone(),
                        });
                    }) {
                        Some(id) => id,
                        None => return Poll::Pending,
                    };
                    if let Some(inst) = next_unclaimed {
                        *instance.borrow_mut() = inst;
                    } else {
                        *instance.borrow_mut() = format!("sub::{id}");
                    }
                    claimed.set(Some(id));
                }
                let our_id = claimed.get().unwrap_or(0);
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::SubWorkflowCompleted { id, result } if *id == our_id => Some(Ok(result.clone())),
                    Event::SubWorkflowFailed { id, error } if *id == our_id => Some(Err(error.clone())),
                    _ => None,
                });
                match completion {
                    Some(result) => Poll::Ready(DurableOutput::SubWorkflow(result)),
                    None => Poll::Pending,
                }
            }
        }
    }
}

// poll() projects &mut self into Kind without structural pinning.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
};

impl DurableFuture {
    /// Await an activity result as a raw string.
    pub fn into_activity(self) -> impl Future<Output = Result<String, ActivityError>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, ActivityError>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => panic!("into_activity used on non-activity future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an activity result decoded to a typed value. A payload that
    /// fails to decode surfaces as a permanent error.
    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<Out, ActivityError>> {
        async move {
            let s = self.into_activity().await?;
            crate::codec::decode::<Out>(&s).map_err(ActivityError::permanent)
        }
    }

    /// Await the corresponding timer firing.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
                    Poll::Ready(other) => panic!("into_timer used on non-timer future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await a sub-workflow result as a raw string.
    pub fn into_sub_workflow(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::SubWorkflow(v)) => Poll::Ready(v),
                    Poll::Ready(other) => panic!("into_sub_workflow used on non-sub-workflow future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await a sub-workflow result decoded to a typed value.
    pub async fn into_sub_workflow_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_sub_workflow().await?;
        crate::codec::decode::<Out>(&s)
    }
}

/// Future for `wait_for_all`: resolves once every child has a completion
/// event, yielding outputs in child (caller) order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(_ctx: WorkflowContext, children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        // Poll every child each pass so all of them claim their scheduling
        // events even when some are already resolvable.
        let mut outputs: Vec<Option<DurableOutput>> = Vec::with_capacity(this.children.len());
        for child in this.children.iter_mut() {
            match Pin::new(child).poll(cx) {
                Poll::Ready(out) => outputs.push(Some(out)),
                Poll::Pending => outputs.push(None),
            }
        }
        if outputs.iter().all(|o| o.is_some()) {
            Poll::Ready(outputs.into_iter().flatten().collect())
        } else {
            Poll::Pending
        }
    }
}

/// Future for `wait_for_any`: resolves with `(winner_index, output)` for the
/// child whose completion was recorded earliest. Losers stay pending and may
/// be awaited again later; dropping them is also fine since their
/// completions are recorded in history either way.
pub struct SelectFuture {
    ctx: WorkflowContext,
    children: Vec<DurableFuture>,
    winner: Cell<Option<usize>>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: WorkflowContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            winner: Cell::new(None),
        }
    }

    /// Take back the remaining children after the race, preserving their
    /// positions; the winner's slot is `None`.
    pub fn into_rest(self) -> Vec<Option<DurableFuture>> {
        let winner = self.winner.get();
        self.children
            .into_iter()
            .enumerate()
            .map(|(i, child)| if Some(i) == winner { None } else { Some(child) })
            .collect()
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        // Poll every child so all claim their scheduling events, then pick as
        // winner the ready child whose completion sits earliest in history.
        // Replays see the same history, so the same winner is chosen even
        // when several completions were batched into one pass.
        let mut ready: Vec<(usize, DurableOutput)> = Vec::new();
        for (i, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                ready.push((i, out));
            }
        }
        if ready.is_empty() {
            return Poll::Pending;
        }

        let winner = {
            let inner = this.ctx.inner.lock().unwrap();
            ready
                .into_iter()
                .min_by_key(|(i, _)| this.children[*i].completion_index(&inner.history).unwrap_or(usize::MAX))
        };
        match winner {
            Some((idx, out)) => {
                this.winner.set(Some(idx));
                Poll::Ready((idx, out))
            }
            None => Poll::Pending,
        }
    }
}
