//! Hosting runtime: dispatchers over the provider queues, the per-instance
//! scheduler loop, retrying activity execution, and crash recovery.
//!
//! One tokio task runs per active instance. Completions flow from the
//! provider's orchestrator queue into the instance inbox; each batch of
//! completions is appended to history, persisted, and only then acked, so a
//! crash at any point redelivers rather than loses work. Idle instances are
//! dehydrated and transparently rehydrated when their next completion
//! arrives.

use crate::logging;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::{Event, WorkflowContext};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub mod completions;
pub mod detect;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;

use async_trait::async_trait;
use completions::CompletionOutcome;

pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, RetryPolicy, WorkflowRegistry,
    WorkflowRegistryBuilder,
};
pub use router::{InstanceRouter, SchedulerMsg};
pub use status::{WorkflowDescriptor, WorkflowStatus, derive_status};

/// Error type returned by workflow wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by workflow handlers invocable by the runtime.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime that executes activities and timers and persists
/// history via a [`HistoryStore`].
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<(Vec<Event>, Result<String, String>)>>>>,
    workflows: WorkflowRegistry,
}

impl Runtime {
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const IDLE_DEHYDRATE_MS: u64 = 1000;
    const APPEND_RETRY_LIMIT: u32 = 5;
    const APPEND_RETRY_DELAY_MS: u64 = 25;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(activities: ActivityRegistry, workflows: WorkflowRegistry) -> Arc<Self> {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(store, activities, workflows).await
    }

    /// Start a new runtime with a custom [`HistoryStore`] implementation.
    /// Any instances left non-terminal by a previous process are reactivated
    /// and their pending work re-armed before dispatchers begin polling.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::new()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            store,
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            workflows,
        });

        runtime.recover_instances().await;

        let orch_handle = runtime.clone().start_orchestrator_dispatcher();
        let work_handle = runtime.clone().start_worker_dispatcher(activities);
        let timer_handle = runtime.clone().start_timer_dispatcher();
        {
            let mut joins = runtime.joins.lock().await;
            joins.push(orch_handle);
            joins.push(work_handle);
            joins.push(timer_handle);
        }

        runtime
    }

    /// Crash recovery: reactivate every instance whose history is not yet
    /// terminal. Activation re-enqueues any unresolved work (idempotently),
    /// so activities and timers lost mid-flight are re-armed.
    async fn recover_instances(self: &Arc<Self>) {
        for instance in self.store.list_instances().await {
            let events = self.store.read_events(&instance).await;
            if events.is_empty() || events.iter().any(|e| e.is_terminal()) {
                continue;
            }
            debug!(instance = %instance, "recovering non-terminal instance");
            self.ensure_instance_active(&instance).await;
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let inner = self.clone().spawn_instance_to_completion(instance);
        let wrapper = tokio::spawn(async move {
            let _ = inner.await;
        });
        self.instance_joins.lock().await.push(wrapper);
        true
    }

    /// Start a workflow instance by definition name, returning a handle that
    /// resolves to the final history and output.
    pub async fn start_workflow(
        self: Arc<Self>,
        instance: &str,
        workflow_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, String> {
        let rx = self
            .clone()
            .start_internal_rx(instance, workflow_name, input.into(), None, None)
            .await?;
        Ok(tokio::spawn(async move {
            rx.await.unwrap_or_else(|_| (Vec::new(), Err("runtime dropped".to_string())))
        }))
    }

    /// Typed start; input and output are serialized internally.
    pub async fn start_workflow_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        workflow_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = crate::codec::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let rx = self
            .clone()
            .start_internal_rx(instance, workflow_name, payload, None, None)
            .await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = match rx.await {
                Ok(v) => v,
                Err(_) => return (Vec::new(), Err("runtime dropped".to_string())),
            };
            let res_t: Result<Out, String> = match res_s {
                Ok(s) => crate::codec::decode::<Out>(&s),
                Err(e) => Err(e),
            };
            (hist, res_t)
        }))
    }

    /// Internal: start a child workflow and record parent linkage.
    pub(crate) async fn start_workflow_with_parent(
        self: Arc<Self>,
        instance: &str,
        workflow_name: &str,
        input: impl Into<String>,
        parent_instance: String,
        parent_id: u64,
    ) -> Result<(), String> {
        let _ = self
            .start_internal_rx(
                instance,
                workflow_name,
                input.into(),
                Some(parent_instance),
                Some(parent_id),
            )
            .await?;
        Ok(())
    }

    async fn start_internal_rx(
        self: Arc<Self>,
        instance: &str,
        workflow_name: &str,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    ) -> Result<oneshot::Receiver<(Vec<Event>, Result<String, String>)>, String> {
        // create_instance arbitrates concurrent starts: exactly one caller
        // wins and appends the start event; later (or racing) duplicates
        // attach to the existing instance.
        match self.store.create_instance(instance).await {
            Ok(()) => {
                let started = vec![Event::WorkflowStarted {
                    name: workflow_name.to_string(),
                    input,
                    parent_instance,
                    parent_id,
                }];
                self.store
                    .append(instance, started)
                    .await
                    .map_err(|e| format!("failed to append WorkflowStarted: {e}"))?;
            }
            Err(e) if e.is_retryable() => {
                return Err(format!("failed to create instance: {e}"));
            }
            Err(_) => {
                warn!(instance, "instance already exists; duplicate start accepted (deduped)");
            }
        }

        // Register the waiter before activating so the instance cannot finish
        // in the gap and leave the waiter hanging.
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);

        let events = self.store.read_events(instance).await;
        match derive_status(&events) {
            WorkflowStatus::Completed { output } => {
                self.notify_waiters(instance, &events, &Ok(output)).await;
            }
            WorkflowStatus::Failed { error } => {
                self.notify_waiters(instance, &events, &Err(error)).await;
            }
            WorkflowStatus::Terminated { reason } => {
                self.notify_waiters(instance, &events, &Err(format!("terminated: {reason}")))
                    .await;
            }
            WorkflowStatus::Running => {
                self.ensure_instance_active(instance).await;
            }
            WorkflowStatus::NotFound => {
                // A racing starter created the instance but its start event
                // is not durable yet; that starter activates the instance,
                // and the waiter registered above is notified on finish.
            }
        }
        Ok(rx)
    }

    /// Request termination of a running workflow instance. Delivery is
    /// durable: a dehydrated instance is terminated without rehydrating its
    /// workflow function.
    pub async fn terminate_workflow(&self, instance: &str, reason: impl Into<String>) {
        let _ = self
            .store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await;
    }

    /// Wait until the workflow reaches a terminal status or the timeout
    /// elapses.
    pub async fn wait_for_workflow(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<WorkflowStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let st = self.get_workflow_status(instance).await;
            if st.is_terminal() {
                return Ok(st);
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = delay_ms.saturating_mul(2).min(100);
        }
    }

    /// Typed variant: `Ok(Ok(out))` on completion, `Ok(Err(e))` on failure
    /// or termination.
    pub async fn wait_for_workflow_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_workflow(instance, timeout).await? {
            WorkflowStatus::Completed { output } => match crate::codec::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            WorkflowStatus::Failed { error } => Ok(Err(error)),
            WorkflowStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            _ => Err(WaitError::Other("non-terminal status from wait".to_string())),
        }
    }

    /// Abort background dispatchers. Channels drop with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Await completion of all outstanding spawned instances.
    pub async fn drain_instances(self: Arc<Self>) {
        let joins: Vec<JoinHandle<()>> = self.instance_joins.lock().await.drain(..).collect();
        let _ = futures::future::join_all(joins).await;
    }

    // ---------------- dispatchers

    fn start_orchestrator_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    match item {
                        WorkItem::ActivityCompleted { instance, id, result } => {
                            self.deliver_or_rehydrate(token, move |t| SchedulerMsg::ActivityCompleted {
                                instance,
                                id,
                                result,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::ActivityFailed { instance, id, error } => {
                            self.deliver_or_rehydrate(token, move |t| SchedulerMsg::ActivityFailed {
                                instance,
                                id,
                                error,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::TimerFired { instance, id, fire_at_ms } => {
                            self.deliver_or_rehydrate(token, move |t| SchedulerMsg::TimerFired {
                                instance,
                                id,
                                fire_at_ms,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::SubWorkflowCompleted {
                            parent_instance,
                            parent_id,
                            result,
                        } => {
                            self.deliver_or_rehydrate(token, move |t| SchedulerMsg::SubWorkflowCompleted {
                                instance: parent_instance,
                                id: parent_id,
                                result,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::SubWorkflowFailed {
                            parent_instance,
                            parent_id,
                            error,
                        } => {
                            self.deliver_or_rehydrate(token, move |t| SchedulerMsg::SubWorkflowFailed {
                                instance: parent_instance,
                                id: parent_id,
                                error,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::TerminateInstance { instance, reason } => {
                            self.handle_terminate_item(&instance, reason, token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in orchestrator dispatcher; state corruption");
                            panic!("unexpected WorkItem in orchestrator dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    /// Route a completion to its instance inbox, rehydrating the instance if
    /// it is dehydrated. Completions for already-terminal instances are
    /// dropped: the result they carry was superseded by the terminal event.
    async fn deliver_or_rehydrate<F>(self: &Arc<Self>, token: String, build_msg: F)
    where
        F: FnOnce(String) -> SchedulerMsg,
    {
        let msg = build_msg(token);
        let instance = msg.instance().to_string();
        if !self.router.inboxes.lock().await.contains_key(&instance) {
            let events = self.store.read_events(&instance).await;
            if events.is_empty() {
                error!(instance = %instance, "completion for unknown instance; dropping");
                let mut msg = msg;
                if let Some(t) = msg.take_ack_token() {
                    let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
                }
                return;
            }
            if events.iter().any(|e| e.is_terminal()) {
                debug!(instance = %instance, "dropping completion for terminal instance");
                let mut msg = msg;
                if let Some(t) = msg.take_ack_token() {
                    let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
                }
                return;
            }
            // Dehydrated: reactivate and abandon for redelivery once the
            // inbox is registered.
            self.ensure_instance_active(&instance).await;
            let mut msg = msg;
            if let Some(t) = msg.take_ack_token() {
                let _ = self.store.abandon(QueueKind::Orchestrator, &t).await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }
        if let Err(mut msg) = self.router.try_send(msg).await {
            // Lost the race with dehydration; redeliver.
            if let Some(t) = msg.take_ack_token() {
                let _ = self.store.abandon(QueueKind::Orchestrator, &t).await;
            }
        }
    }

    /// Terminate an instance whether or not it is currently active. Inactive
    /// instances get the terminal event appended directly, plus cascade to
    /// their unfinished children.
    async fn handle_terminate_item(self: &Arc<Self>, instance: &str, reason: String, token: String) {
        let delivered = self
            .router
            .try_send(SchedulerMsg::Terminate {
                instance: instance.to_string(),
                reason: reason.clone(),
                ack_token: Some(token.clone()),
            })
            .await;
        if delivered.is_ok() {
            return;
        }

        let events = self.store.read_events(instance).await;
        if events.is_empty() || events.iter().any(|e| e.is_terminal()) {
            let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        match self
            .store
            .append(instance, vec![Event::WorkflowTerminated { reason: reason.clone() }])
            .await
        {
            Ok(_) => {
                self.cascade_terminate(instance, &events).await;
                let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
            }
            Err(e) => {
                warn!(instance, error = %e, "failed to append WorkflowTerminated; abandoning for retry");
                let _ = self.store.abandon(QueueKind::Orchestrator, &token).await;
            }
        }
    }

    /// Enqueue termination for every scheduled child without a completion.
    async fn cascade_terminate(self: &Arc<Self>, instance: &str, events: &[Event]) {
        let completed: HashSet<u64> = events
            .iter()
            .filter_map(|e| match e {
                Event::SubWorkflowCompleted { id, .. } | Event::SubWorkflowFailed { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        for e in events {
            if let Event::SubWorkflowScheduled { id, instance: suffix, .. } = e {
                if !completed.contains(id) {
                    let child = format!("{instance}::{suffix}");
                    let _ = self
                        .store
                        .enqueue_work(
                            QueueKind::Orchestrator,
                            WorkItem::TerminateInstance {
                                instance: child,
                                reason: "parent terminated".to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    fn start_worker_dispatcher(self: Arc<Self>, activities: ActivityRegistry) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_peek_lock(QueueKind::Worker).await {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                        } => {
                            // One task per activity so long-running work does
                            // not serialize the worker queue.
                            let rt = self.clone();
                            let entry = activities.get(&name);
                            tokio::spawn(async move {
                                rt.execute_activity(instance, id, name, input, entry, token).await;
                            });
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in worker dispatcher; state corruption");
                            panic!("unexpected WorkItem in worker dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    /// Run one activity under its retry policy and enqueue the outcome.
    /// Transient attempts stay inside this loop; history only ever sees the
    /// final result.
    async fn execute_activity(
        self: Arc<Self>,
        instance: String,
        id: u64,
        name: String,
        input: String,
        entry: Option<registry::ActivityEntry>,
        token: String,
    ) {
        let outcome = match entry {
            None => Err(crate::ActivityError::permanent(format!("unregistered:{name}"))),
            Some(entry) => {
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    match entry.handler.invoke(input.clone()).await {
                        Ok(result) => break Ok(result),
                        Err(err) if err.is_retryable() && attempt < entry.policy.max_attempts => {
                            debug!(
                                instance = %instance,
                                id,
                                activity = %name,
                                attempt,
                                error = %err,
                                "transient activity failure; retrying"
                            );
                            tokio::time::sleep(entry.policy.delay_for(attempt)).await;
                        }
                        Err(err) => break Err(err),
                    }
                }
            }
        };
        let work = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                id,
                result,
            },
            Err(error) => WorkItem::ActivityFailed {
                instance: instance.clone(),
                id,
                error,
            },
        };
        if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, work).await {
            warn!(instance = %instance, id, error = %e, "failed to enqueue activity outcome; abandoning for retry");
            let _ = self.store.abandon(QueueKind::Worker, &token).await;
            return;
        }
        let _ = self.store.ack(QueueKind::Worker, &token).await;
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_peek_lock(QueueKind::Timer).await {
                    match item {
                        WorkItem::TimerSchedule { instance, id, fire_at_ms } => {
                            let rt = self.clone();
                            tokio::spawn(async move {
                                let now = std::time::SystemTime::now()
                                    .duration_since(std::time::UNIX_EPOCH)
                                    .map(|d| d.as_millis() as u64)
                                    .unwrap_or(0);
                                if fire_at_ms > now {
                                    tokio::time::sleep(std::time::Duration::from_millis(fire_at_ms - now)).await;
                                }
                                let _ = rt
                                    .store
                                    .enqueue_work(
                                        QueueKind::Orchestrator,
                                        WorkItem::TimerFired { instance, id, fire_at_ms },
                                    )
                                    .await;
                            });
                            // Ack now; a timer lost to a crash here is
                            // re-armed by rehydration since no TimerFired
                            // ever lands in history.
                            let _ = self.store.ack(QueueKind::Timer, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in timer dispatcher; state corruption");
                            panic!("unexpected WorkItem in timer dispatcher");
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                }
            }
        })
    }

    // ---------------- per-instance scheduler

    /// Persist events with a bounded retry on retryable provider errors.
    async fn persist(&self, instance: &str, events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.append(instance, events.clone()).await {
                Ok(seq) => return Ok(seq),
                Err(e) if e.is_retryable() && attempt < Self::APPEND_RETRY_LIMIT => {
                    warn!(instance, attempt, error = %e, "history append failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(Self::APPEND_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    /// Route a child's final result back to its parent via the durable queue.
    async fn notify_parent(
        &self,
        parent_link: &Option<(String, u64)>,
        result: &Result<String, String>,
    ) {
        if let Some((parent_instance, parent_id)) = parent_link {
            let item = match result {
                Ok(s) => WorkItem::SubWorkflowCompleted {
                    parent_instance: parent_instance.clone(),
                    parent_id: *parent_id,
                    result: s.clone(),
                },
                Err(e) => WorkItem::SubWorkflowFailed {
                    parent_instance: parent_instance.clone(),
                    parent_id: *parent_id,
                    error: e.clone(),
                },
            };
            let _ = self.store.enqueue_work(QueueKind::Orchestrator, item).await;
        }
    }

    /// Materialize one turn's decisions into dispatched work.
    async fn apply_decisions(self: &Arc<Self>, instance: &str, decisions: Vec<crate::Action>) {
        for d in decisions {
            match d {
                crate::Action::CallActivity { id, name, input } => {
                    let _ = self
                        .store
                        .enqueue_work(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.to_string(),
                                id,
                                name,
                                input,
                            },
                        )
                        .await;
                }
                crate::Action::CreateTimer { id, fire_at_ms } => {
                    let _ = self
                        .store
                        .enqueue_work(
                            QueueKind::Timer,
                            WorkItem::TimerSchedule {
                                instance: instance.to_string(),
                                id,
                                fire_at_ms,
                            },
                        )
                        .await;
                }
                crate::Action::StartSubWorkflow {
                    id,
                    name,
                    instance: suffix,
                    input,
                } => {
                    let child = format!("{instance}::{suffix}");
                    if let Err(e) = self
                        .clone()
                        .start_workflow_with_parent(&child, &name, input, instance.to_string(), id)
                        .await
                    {
                        warn!(instance, id, child = %child, error = %e, "failed to start sub-workflow");
                    }
                }
            }
        }
    }

    /// Re-attach scheduled-but-unresolved children on activation: restart
    /// missing ones, re-activate running ones, and forward results of
    /// children that finished while the parent was down.
    async fn rehydrate_children(self: &Arc<Self>, instance: &str, history: &[Event]) {
        let completed: HashSet<u64> = history
            .iter()
            .filter_map(|e| match e {
                Event::SubWorkflowCompleted { id, .. } | Event::SubWorkflowFailed { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        for e in history {
            let (id, name, suffix, input) = match e {
                Event::SubWorkflowScheduled { id, name, instance, input } if !completed.contains(id) => {
                    (*id, name, instance, input)
                }
                _ => continue,
            };
            let child = format!("{instance}::{suffix}");
            let child_events = self.store.read_events(&child).await;
            match derive_status(&child_events) {
                WorkflowStatus::NotFound => {
                    if let Err(err) = self
                        .clone()
                        .start_workflow_with_parent(&child, name, input.clone(), instance.to_string(), id)
                        .await
                    {
                        warn!(instance, id, child = %child, error = %err, "failed to restart sub-workflow");
                    }
                }
                WorkflowStatus::Running => {
                    self.ensure_instance_active(&child).await;
                }
                WorkflowStatus::Completed { output } => {
                    self.notify_parent(&Some((instance.to_string(), id)), &Ok(output)).await;
                }
                WorkflowStatus::Failed { error } => {
                    self.notify_parent(&Some((instance.to_string(), id)), &Err(error)).await;
                }
                WorkflowStatus::Terminated { reason } => {
                    self.notify_parent(&Some((instance.to_string(), id)), &Err(format!("terminated: {reason}")))
                        .await;
                }
            }
        }
    }

    /// Spawn an instance and return a handle resolving to its history and
    /// output when complete.
    pub fn spawn_instance_to_completion(self: Arc<Self>, instance: &str) -> JoinHandle<(Vec<Event>, Result<String, String>)> {
        let inst = instance.to_string();
        tokio::spawn(async move { self.run_instance_to_completion(&inst).await })
    }

    /// Run a single instance's scheduler loop to completion (or dehydration),
    /// returning its final history and output.
    pub async fn run_instance_to_completion(self: Arc<Self>, instance: &str) -> (Vec<Event>, Result<String, String>) {
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Release the active flag even if this task panics.
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut history: Vec<Event> = self.store.read_events(instance).await;

        // Re-activation of an already-finished instance just reports the
        // recorded result; nothing is replayed or appended.
        let status = derive_status(&history);
        if status.is_terminal() {
            let result = match status {
                WorkflowStatus::Completed { output } => Ok(output),
                WorkflowStatus::Failed { error } => Err(error),
                WorkflowStatus::Terminated { reason } => Err(format!("terminated: {reason}")),
                _ => unreachable!(),
            };
            self.notify_waiters(instance, &history, &result).await;
            return (history, result);
        }

        let (workflow_name, current_input, parent_link) = match history.iter().find_map(|e| match e {
            Event::WorkflowStarted {
                name,
                input,
                parent_instance,
                parent_id,
            } => Some((
                name.clone(),
                input.clone(),
                parent_instance.clone().zip(*parent_id),
            )),
            _ => None,
        }) {
            Some(v) => v,
            None => {
                error!(instance, "activation without WorkflowStarted in history; state corruption");
                let err = "no WorkflowStarted in history".to_string();
                self.notify_waiters(instance, &history, &Err(err.clone())).await;
                return (history, Err(err));
            }
        };

        let mut comp_rx = self.router.register(instance).await;

        // Re-arm any in-flight work lost to a crash or dehydration.
        completions::rehydrate_pending(instance, &history, &self.store).await;
        self.rehydrate_children(instance, &history).await;

        let handler = match self.workflows.get(&workflow_name) {
            Some(h) => h,
            None => {
                let err = format!("unregistered:{workflow_name}");
                return self
                    .finish_instance(instance, history, Err(err), &parent_link)
                    .await;
            }
        };

        use crate::runtime::replay::ReplayEngine as _;
        let engine = crate::runtime::replay::DefaultReplayEngine::new();
        let mut turn_index: u64 = 0;
        loop {
            let baseline_len = history.len();
            let turn = engine.replay(history, turn_index, handler.clone(), current_input.clone());
            history = turn.history;

            for (level, msg) in &turn.logs {
                logging::emit(instance, turn_index, *level, msg);
            }

            if let Some(nd) = turn.nondeterminism {
                let err = format!("nondeterministic workflow: {nd}");
                // Persist any scheduling deltas first so the failed history
                // reads coherently.
                if history.len() > baseline_len {
                    let _ = self.persist(instance, history[baseline_len..].to_vec()).await;
                }
                return self
                    .finish_instance(instance, history, Err(err), &parent_link)
                    .await;
            }

            if let Some(out) = turn.output {
                if history.len() > baseline_len {
                    if let Err(e) = self.persist(instance, history[baseline_len..].to_vec()).await {
                        return self.persist_failed(instance, history, e, &parent_link).await;
                    }
                }
                return self.finish_instance(instance, history, out, &parent_link).await;
            }

            // Persist scheduling deltas before dispatching the work they
            // describe; a crash after dispatch then replays from a history
            // that already names the work.
            let mut persisted_len = baseline_len;
            if history.len() > persisted_len {
                if let Err(e) = self.persist(instance, history[persisted_len..].to_vec()).await {
                    return self.persist_failed(instance, history, e, &parent_link).await;
                }
                persisted_len = history.len();
            }
            self.apply_decisions(instance, turn.actions).await;

            // Block for the next completion; dehydrate when idle with nobody
            // waiting in-process.
            let first = match tokio::time::timeout(
                std::time::Duration::from_millis(Self::IDLE_DEHYDRATE_MS),
                comp_rx.recv(),
            )
            .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.router.unregister(instance).await;
                    return (history, Err("inbox closed".into()));
                }
                Err(_timeout) => {
                    let has_waiters = self.result_waiters.lock().await.contains_key(instance);
                    if has_waiters {
                        continue;
                    }
                    debug!(instance, "dehydrating idle instance");
                    self.router.unregister(instance).await;
                    return (history, Ok(String::new()));
                }
            };

            // Batch available completions so one replay pass absorbs them
            // all, then persist before acking any of them.
            let mut batch = vec![first];
            for _ in 0..Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let mut ack_after_persist: Vec<String> = Vec::new();
            let mut ack_immediate: Vec<String> = Vec::new();
            let mut terminate_reason: Option<(String, Option<String>)> = None;
            let mut mismatch: Option<String> = None;
            let mut batch = batch.into_iter();
            while let Some(msg) = batch.next() {
                if let SchedulerMsg::Terminate { reason, mut ack_token, .. } = msg {
                    terminate_reason = Some((reason, ack_token.take()));
                    break;
                }
                match completions::append_completion(&mut history, msg) {
                    CompletionOutcome::Applied { token } => {
                        if let Some(t) = token {
                            ack_after_persist.push(t);
                        }
                    }
                    CompletionOutcome::Ignored { token } => {
                        if let Some(t) = token {
                            ack_immediate.push(t);
                        }
                    }
                    CompletionOutcome::Mismatch { token, error } => {
                        if let Some(t) = token {
                            ack_after_persist.push(t);
                        }
                        mismatch = Some(error);
                        break;
                    }
                }
            }
            // Abandon anything cut off by a terminate or mismatch; redelivery
            // finds a terminal instance and drops them.
            for mut msg in batch {
                if let Some(t) = msg.take_ack_token() {
                    let _ = self.store.abandon(QueueKind::Orchestrator, &t).await;
                }
            }

            for t in ack_immediate.drain(..) {
                let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
            }
            if history.len() > persisted_len {
                if let Err(e) = self.persist(instance, history[persisted_len..].to_vec()).await {
                    return self.persist_failed(instance, history, e, &parent_link).await;
                }
            }
            for t in ack_after_persist.drain(..) {
                let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
            }

            if let Some(err) = mismatch {
                let err = format!("nondeterministic workflow: {err}");
                return self
                    .finish_instance(instance, history, Err(err), &parent_link)
                    .await;
            }

            if let Some((reason, token)) = terminate_reason {
                let term = Event::WorkflowTerminated { reason: reason.clone() };
                if let Err(e) = self.persist(instance, vec![term.clone()]).await {
                    if let Some(t) = token {
                        let _ = self.store.abandon(QueueKind::Orchestrator, &t).await;
                    }
                    return self.persist_failed(instance, history, e, &parent_link).await;
                }
                history.push(term);
                if let Some(t) = token {
                    let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
                }
                self.cascade_terminate(instance, &history).await;
                let result = Err(format!("terminated: {reason}"));
                self.notify_waiters(instance, &history, &result).await;
                self.notify_parent(&parent_link, &result).await;
                self.router.unregister(instance).await;
                return (history, result);
            }

            turn_index = turn_index.saturating_add(1);
        }
    }

    /// Append the terminal event, notify waiters and the parent, and release
    /// the inbox.
    async fn finish_instance(
        self: &Arc<Self>,
        instance: &str,
        mut history: Vec<Event>,
        result: Result<String, String>,
        parent_link: &Option<(String, u64)>,
    ) -> (Vec<Event>, Result<String, String>) {
        let term = match &result {
            Ok(s) => Event::WorkflowCompleted { output: s.clone() },
            Err(e) => Event::WorkflowFailed { error: e.clone() },
        };
        if let Err(e) = self.persist(instance, vec![term.clone()]).await {
            let err = self.persist_failed(instance, history, e, parent_link).await;
            return err;
        }
        history.push(term);
        self.notify_waiters(instance, &history, &result).await;
        self.notify_parent(parent_link, &result).await;
        self.router.unregister(instance).await;
        (history, result)
    }

    /// A history append that keeps failing is unrecoverable for this process:
    /// wake waiters with the error, then crash so recovery replays from the
    /// last durable state.
    async fn persist_failed(
        self: &Arc<Self>,
        instance: &str,
        history: Vec<Event>,
        e: ProviderError,
        _parent_link: &Option<(String, u64)>,
    ) -> (Vec<Event>, Result<String, String>) {
        error!(instance, error = %e, "history append failed");
        let err = format!("history append failed: {e}");
        self.notify_waiters(instance, &history, &Err(err.clone())).await;
        self.router.unregister(instance).await;
        panic!("history append failed: {e}");
    }
}
