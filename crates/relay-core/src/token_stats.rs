//! Token-stats worker (spec §4.9).
//!
//! A single task drains a bounded channel of [`TokenStatsUpdate`] records and
//! applies them to the store. Billing integrity requires successful-request
//! updates to not get silently lost under backpressure, while failed-request
//! updates are best-effort. Grounded in the teacher's background-task shape
//! (`gproxy-provider-core/src/credential/unavailable_queue.rs`'s
//! `spawn_recover_task`), generalized from a recovery queue to a write-behind
//! stats queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_store::{Store, TokenStatsUpdate};
use tokio::sync::mpsc;

const BLOCKING_SEND_BOUND: Duration = Duration::from_millis(100);
pub const SHUTDOWN_WRITE_BOUND: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct DroppedCounters {
    pub success_drops: AtomicU64,
    pub failure_drops: AtomicU64,
}

#[derive(Clone)]
pub struct TokenStatsHandle {
    tx: mpsc::Sender<TokenStatsUpdate>,
    dropped: Arc<DroppedCounters>,
    store: Arc<dyn Store>,
    shutting_down: Arc<AtomicBool>,
}

impl TokenStatsHandle {
    /// Successful requests: block up to 100 ms, then try once more
    /// non-blocking, then log-and-drop with a counter increment. During
    /// shutdown, bypass the queue entirely and write synchronously.
    pub async fn enqueue_success(&self, update: TokenStatsUpdate) {
        if self.shutting_down.load(Ordering::Acquire) {
            write_synchronously_on_shutdown(self.store.as_ref(), update).await;
            return;
        }
        if tokio::time::timeout(BLOCKING_SEND_BOUND, self.tx.send(update.clone()))
            .await
            .is_ok()
        {
            return;
        }
        if self.tx.try_send(update).is_ok() {
            return;
        }
        self.dropped.success_drops.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(event = "token_stats_drop", kind = "success", "dropping successful-request token stats update");
    }

    /// Failed requests: one non-blocking attempt, drop with a sampled log.
    /// Same shutdown bypass as [`Self::enqueue_success`].
    pub async fn enqueue_failure(&self, update: TokenStatsUpdate) {
        if self.shutting_down.load(Ordering::Acquire) {
            write_synchronously_on_shutdown(self.store.as_ref(), update).await;
            return;
        }
        if self.tx.try_send(update).is_ok() {
            return;
        }
        let total = self.dropped.failure_drops.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 100 == 1 {
            tracing::debug!(event = "token_stats_drop", kind = "failure", total, "dropping failed-request token stats update");
        }
    }

    pub fn dropped_counters(&self) -> Arc<DroppedCounters> {
        self.dropped.clone()
    }

    /// Flip into shutdown mode: subsequent enqueues bypass the queue and
    /// write synchronously instead of racing the worker's channel closure.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

/// Spawn the worker and return a handle plus its `JoinHandle` for graceful
/// shutdown (await it after closing the handle's sender side by dropping it).
pub fn spawn(store: Arc<dyn Store>, buffer_size: usize) -> (TokenStatsHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(buffer_size);
    let dropped = Arc::new(DroppedCounters::default());
    let worker_store = store.clone();
    let join = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            worker_store.record_token_stats(update).await;
        }
    });
    let handle = TokenStatsHandle {
        tx,
        dropped,
        store,
        shutting_down: Arc::new(AtomicBool::new(false)),
    };
    (handle, join)
}

/// Shutdown bypass: write synchronously with a context detached from any
/// request, bounded to [`SHUTDOWN_WRITE_BOUND`]. Used when the queue itself
/// may be racing closure and a synchronous drain is simpler and correct.
pub async fn write_synchronously_on_shutdown(store: &dyn Store, update: TokenStatsUpdate) {
    let write = store.record_token_stats(update);
    let _ = tokio::time::timeout(SHUTDOWN_WRITE_BOUND, write).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::InMemoryStore;

    fn update(model: &str) -> TokenStatsUpdate {
        TokenStatsUpdate {
            token_id: 1,
            channel_id: 1,
            key_index: 0,
            model: model.to_string(),
            success: true,
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_micro_usd: 100,
        }
    }

    #[tokio::test]
    async fn success_update_reaches_store() {
        let concrete = Arc::new(InMemoryStore::new());
        let (handle, join) = spawn(concrete.clone(), 8);
        handle.enqueue_success(update("gpt-4")).await;
        drop(handle);
        join.await.unwrap();
        assert_eq!(concrete.token_stats_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn failure_update_is_best_effort_and_does_not_block() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let (handle, join) = spawn(store, 1);
        let mut u = update("gpt-4");
        u.success = false;
        handle.enqueue_failure(u).await;
        drop(handle);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_write_bypasses_queue() {
        let store = InMemoryStore::new();
        write_synchronously_on_shutdown(&store, update("gpt-4")).await;
        assert_eq!(store.token_stats_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn begin_shutdown_routes_enqueues_through_the_bypass() {
        let concrete = Arc::new(InMemoryStore::new());
        // Buffer of 0 would make a normal enqueue block/drop; the bypass
        // must not go through the channel at all once shutdown starts.
        let (handle, join) = spawn(concrete.clone(), 1);
        handle.begin_shutdown();
        handle.enqueue_success(update("gpt-4")).await;
        handle.enqueue_failure(update("gpt-4")).await;
        drop(handle);
        join.await.unwrap();
        assert_eq!(concrete.token_stats_snapshot().len(), 2);
    }
}
