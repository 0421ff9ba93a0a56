//! Filesystem-backed provider writing one JSONL file per instance, plus
//! JSONL queue files with lock sidecars for peek-lock semantics. Intended
//! for local development and crash-recovery tests, not multi-process use.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{HistoryStore, ProviderError, QueueKind, Recorded, WorkItem, completion_key, HISTORY_CAP};
use crate::Event;

#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    worker_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    // Serializes queue read-modify-write cycles across tasks.
    queues_lock: Arc<Mutex<()>>,
    // Serializes the read-seq/write/sync cycle in `append`; without it,
    // concurrent appends to one instance interleave partial lines and
    // acknowledged events can vanish.
    history_lock: Arc<Mutex<()>>,
    token_counter: Arc<AtomicU64>,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory. If `reset_on_create` is
    /// true, any existing data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let worker_q = path.join("worker-queue.jsonl");
        let timer_q = path.join("timer-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(path.join("instances"));
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&worker_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&timer_q);
        Self {
            root: path,
            orch_queue_file: orch_q,
            worker_queue_file: worker_q,
            timer_queue_file: timer_q,
            cap: HISTORY_CAP,
            queues_lock: Arc::new(Mutex::new(())),
            history_lock: Arc::new(Mutex::new(())),
            token_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a store with a custom history cap (test utility).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn instance_path(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(format!("{instance}.jsonl"))
    }

    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.worker_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/worker"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    /// Rewrite a queue file atomically via tmp-rename.
    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| ProviderError::retryable("write_queue", e.to_string()))?;
            for item in items {
                let line = serde_json::to_string(item)
                    .map_err(|e| ProviderError::permanent("write_queue", e.to_string()))?;
                use std::io::Write as _;
                tf.write_all(line.as_bytes())
                    .and_then(|_| tf.write_all(b"\n"))
                    .map_err(|e| ProviderError::retryable("write_queue", e.to_string()))?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| ProviderError::retryable("write_queue", e.to_string()))?;
        Ok(())
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn read_records(&self, instance: &str) -> Vec<Recorded> {
        let data = fs::read_to_string(self.instance_path(instance)).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<Recorded>(l) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::error!(instance, error = %e, "unparseable history record; on-disk log is corrupt");
                    None
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        fs::create_dir_all(self.root.join("instances"))
            .await
            .map_err(|e| ProviderError::retryable("create_instance", e.to_string()))?;
        let path = self.instance_path(instance);
        // create_new is the atomic arbiter for concurrent creates.
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ProviderError::permanent("create_instance", format!("instance already exists: {instance}"))
                } else {
                    ProviderError::retryable("create_instance", e.to_string())
                }
            })?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let path = self.instance_path(instance);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| ProviderError::retryable("remove_instance", e.to_string()))?
        {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| ProviderError::retryable("remove_instance", e.to_string()))?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Vec<Recorded> {
        self.read_records(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, ProviderError> {
        // Single writer per instance: hold the lock across read-seq, write,
        // and sync so concurrent appends never share a seq snapshot or
        // interleave partial lines.
        let _guard = self.history_lock.lock().await;
        let path = self.instance_path(instance);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| ProviderError::retryable("append", e.to_string()))?
        {
            return Err(ProviderError::permanent(
                "append",
                format!("instance not found: {instance}"),
            ));
        }
        let existing = self.read_records(instance).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(ProviderError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.cap,
                    existing.len(),
                    new_events.len()
                ),
            ));
        }
        let mut seen: HashSet<(u64, &'static str)> =
            existing.iter().filter_map(|r| completion_key(&r.event)).collect();
        let mut seq = existing.last().map(|r| r.seq).unwrap_or(0);
        let ts_ms = Self::now_ms();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ProviderError::retryable("append", e.to_string()))?;
        for event in new_events {
            if let Some(key) = completion_key(&event) {
                if !seen.insert(key) {
                    continue;
                }
            }
            seq += 1;
            let record = Recorded { seq, ts_ms, event };
            let line =
                serde_json::to_string(&record).map_err(|e| ProviderError::permanent("append", e.to_string()))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| ProviderError::retryable("append", e.to_string()))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| ProviderError::retryable("append", e.to_string()))?;
        }
        // Events must be on disk before the runtime acks the work that
        // produced them; crash recovery depends on it.
        file.sync_all()
            .await
            .map_err(|e| ProviderError::retryable("append", e.to_string()))?;
        Ok(seq)
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        out.push(stem.to_string());
                    }
                }
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _guard = self.queues_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queues_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        self.write_queue(kind, &items).ok()?;

        let pid = std::process::id();
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let token = format!("{pid:x}-{n:x}");
        let _ = std::fs::create_dir_all(self.lock_dir(kind));
        let line = serde_json::to_string(&first).ok()?;
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| ProviderError::retryable("ack", e.to_string()))?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _guard = self.queues_lock.lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| ProviderError::retryable("abandon", e.to_string()))?;
        let item: WorkItem =
            serde_json::from_str(&data).map_err(|e| ProviderError::permanent("abandon", e.to_string()))?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| ProviderError::retryable("abandon", e.to_string()))?;
        Ok(())
    }

    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for r in self.read_records(&inst).await {
                out.push_str(&format!("  #{} {:#?}\n", r.seq, r.event));
            }
        }
        out
    }
}
