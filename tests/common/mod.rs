use agentflow::Event;
use agentflow::providers::HistoryStore;
use std::sync::Arc;

/// Poll an instance's history until `pred` holds or `timeout_ms` elapses.
#[allow(dead_code)]
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let events = store.read_events(instance).await;
        if pred(&events) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Wait until the instance has any terminal event in history.
#[allow(dead_code)]
pub async fn wait_for_terminal(store: Arc<dyn HistoryStore>, instance: &str, timeout_ms: u64) -> bool {
    wait_for_history(store, instance, |h| h.iter().any(|e| e.is_terminal()), timeout_ms).await
}
