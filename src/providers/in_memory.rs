//! In-memory provider for tests and samples. Same semantics as the
//! filesystem store (sequence assignment, completion dedupe, peek-lock
//! queues) without any durability.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{HistoryStore, ProviderError, QueueKind, Recorded, WorkItem, completion_key, HISTORY_CAP};
use crate::Event;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Recorded>>>,
    orchestrator_q: Mutex<Vec<WorkItem>>,
    worker_q: Mutex<Vec<WorkItem>>,
    timer_q: Mutex<Vec<WorkItem>>,
    // Peek-lock state per queue: token -> item, invisible until ack/abandon.
    invisible_orchestrator: Mutex<HashMap<String, WorkItem>>,
    invisible_worker: Mutex<HashMap<String, WorkItem>>,
    invisible_timer: Mutex<HashMap<String, WorkItem>>,
    token_counter: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Vec<WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
            QueueKind::Timer => &self.timer_q,
        }
    }

    fn invisible(&self, kind: QueueKind) -> &Mutex<HashMap<String, WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
            QueueKind::Timer => &self.invisible_timer,
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.histories.lock().await;
        if g.contains_key(instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.histories.lock().await;
        if g.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        Ok(())
    }

    async fn read(&self, instance: &str) -> Vec<Recorded> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut g = self.histories.lock().await;
        let log = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if log.len() + new_events.len() > HISTORY_CAP {
            return Err(ProviderError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={HISTORY_CAP}, have={}, append={})",
                    log.len(),
                    new_events.len()
                ),
            ));
        }
        let mut seen: HashSet<(u64, &'static str)> = log.iter().filter_map(|r| completion_key(&r.event)).collect();
        let mut seq = log.last().map(|r| r.seq).unwrap_or(0);
        let ts_ms = Self::now_ms();
        for event in new_events {
            if let Some(key) = completion_key(&event) {
                if !seen.insert(key) {
                    continue;
                }
            }
            seq += 1;
            log.push(Recorded { seq, ts_ms, event });
        }
        Ok(seq)
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut q = self.queue(kind).lock().await;
        if !q.contains(&item) {
            q.push(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = {
            let mut q = self.queue(kind).lock().await;
            if q.is_empty() {
                return None;
            }
            q.remove(0)
        };
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let token = format!("{kind:?}:{n:x}");
        self.invisible(kind).lock().await.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.invisible(kind).lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        if let Some(item) = self.invisible(kind).lock().await.remove(token) {
            self.queue(kind).lock().await.insert(0, item);
        }
        Ok(())
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            self.queue(kind).lock().await.clear();
            self.invisible(kind).lock().await.clear();
        }
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.histories.lock().await;
        let mut out = String::new();
        for (inst, records) in g.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for r in records {
                out.push_str(&format!("  #{} {:#?}\n", r.seq, r.event));
            }
        }
        out
    }
}
