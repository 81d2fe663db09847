//! Byte-bounded batching and bounded-concurrency transmission.

use super::backoff::{retry_transient, BackoffPolicy};
use super::config::BulkConfig;
use crate::engine::SearchEngine;
use crate::types::{Batch, BulkResponse, ItemFailure, WriteAction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Item failures kept verbatim for the summary; the rest are only counted.
pub const MAX_RECORDED_FAILURES: usize = 100;

/// Counters shared by every transmission of a session.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: Arc<AtomicU64>,
    failed_items: AtomicU64,
    failed_batches: AtomicU64,
    batches: AtomicU64,
    bytes: AtomicU64,
    failures: Mutex<Vec<ItemFailure>>,
}

impl DispatchStats {
    /// Actions acknowledged by the engine, successful or not.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// The processed counter itself, for observers that poll it.
    pub fn processed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.processed)
    }

    pub fn failed_items(&self) -> u64 {
        self.failed_items.load(Ordering::SeqCst)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::SeqCst)
    }

    /// Batches the engine acknowledged.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Estimated bytes of acknowledged batches.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<ItemFailure> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }

    fn record_response(&self, index: &str, batch: &Batch, response: &BulkResponse, attempts: u32) {
        let total = self
            .processed
            .fetch_add(response.items.len() as u64, Ordering::SeqCst)
            + response.items.len() as u64;
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.bytes
            .fetch_add(batch.size_in_bytes() as u64, Ordering::SeqCst);

        for item in response.items.iter().filter(|i| i.is_failed()) {
            let reason = item.failure.clone().unwrap_or_default();
            tracing::error!(
                "[BULK {}] index [{}], type [{}], id [{}], message [{}]",
                index,
                item.index,
                item.doc_type.as_deref().unwrap_or("_doc"),
                item.id,
                reason
            );
            self.failed_items.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut failures) = self.failures.lock() {
                if failures.len() < MAX_RECORDED_FAILURES {
                    failures.push(ItemFailure {
                        index: item.index.clone(),
                        doc_type: item.doc_type.clone(),
                        id: item.id.clone(),
                        reason,
                    });
                }
            }
        }

        tracing::debug!(
            "[BULK {}] batch {} acknowledged: {} actions, {} bytes, {} attempt(s), took {}ms, total={}",
            index,
            batch.id(),
            batch.len(),
            batch.size_in_bytes(),
            attempts,
            response.took_ms,
            total
        );
    }

    fn record_batch_failure(&self, index: &str, batch: &Batch, reason: &str) {
        tracing::error!(
            "[BULK {}] Fail to execute bulk request {} ({} actions): {}",
            index,
            batch.id(),
            batch.len(),
            reason
        );
        self.failed_batches.fetch_add(1, Ordering::SeqCst);
        self.failed_items
            .fetch_add(batch.len() as u64, Ordering::SeqCst);
    }
}

/// Send one sealed batch until the engine answers for good or the retry
/// window closes.
async fn execute(
    engine: Arc<dyn SearchEngine>,
    index: String,
    batch: Batch,
    retry: Retry,
    stats: Arc<DispatchStats>,
) {
    let label = format!("[BULK {}] batch {}", index, batch.id());
    let engine = engine.as_ref();
    let sealed = &batch;
    let (result, attempts) =
        retry_transient(&retry.backoff, retry.window, &label, move || engine.bulk(sealed)).await;

    match result {
        Ok(response) => stats.record_response(&index, &batch, &response, attempts),
        Err(e) => stats.record_batch_failure(&index, &batch, &e.to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    backoff: BackoffPolicy,
    /// How long one batch keeps being resent on transient errors.
    window: Duration,
}

/// Groups actions into batches and hands sealed batches to the engine.
///
/// With a concurrency of 0 the submitting task sends each batch itself and
/// waits for its answer. With N > 0 up to N batches are sent in the
/// background; submitting more waits for a free slot.
///
/// A batch the engine keeps refusing with transient errors is given up on,
/// and counted as failed, after the configured drain timeout.
pub struct BatchDispatcher {
    engine: Arc<dyn SearchEngine>,
    index: String,
    flush_bytes: usize,
    retry: Retry,
    permits: Option<Arc<Semaphore>>,
    in_flight: JoinSet<()>,
    current: Batch,
    next_batch_id: u64,
    stats: Arc<DispatchStats>,
}

impl BatchDispatcher {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        index: impl Into<String>,
        concurrency: usize,
        config: &BulkConfig,
    ) -> Self {
        BatchDispatcher {
            engine,
            index: index.into(),
            flush_bytes: config.flush_bytes.max(1),
            retry: Retry {
                backoff: config.backoff,
                window: config.drain_timeout,
            },
            permits: (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency))),
            in_flight: JoinSet::new(),
            current: Batch::new(1),
            next_batch_id: 1,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Estimated size of the batch being filled.
    pub fn pending_bytes(&self) -> usize {
        self.current.size_in_bytes()
    }

    /// Batches handed to background tasks and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Append `action` to the current batch, sending it once it is full.
    pub async fn submit(&mut self, action: WriteAction) {
        self.current.push(action);
        if self.current.size_in_bytes() >= self.flush_bytes {
            self.seal_and_send().await;
        }
    }

    /// Send the partial batch, if any, and wait for every batch to resolve.
    ///
    /// Unbounded: callers wrap it in a timeout.
    pub async fn flush_and_drain(&mut self) {
        if !self.current.is_empty() {
            self.seal_and_send().await;
        }
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("[BULK {}] bulk task ended abnormally: {}", self.index, e);
            }
        }
    }

    /// Cancel background transmissions. Returns how many were cancelled.
    pub fn abort_in_flight(&mut self) -> usize {
        let n = self.in_flight.len();
        self.in_flight.abort_all();
        n
    }

    async fn seal_and_send(&mut self) {
        self.next_batch_id += 1;
        let batch = std::mem::replace(&mut self.current, Batch::new(self.next_batch_id));
        tracing::debug!(
            "[BULK {}] sealed batch {}: {} actions, {} bytes",
            self.index,
            batch.id(),
            batch.len(),
            batch.size_in_bytes()
        );
        self.send(batch).await;
    }

    async fn send(&mut self, batch: Batch) {
        self.reap_finished();

        let engine = Arc::clone(&self.engine);
        let stats = Arc::clone(&self.stats);
        let index = self.index.clone();
        let retry = self.retry;

        let Some(permits) = &self.permits else {
            execute(engine, index, batch, retry, stats).await;
            return;
        };

        match Arc::clone(permits).acquire_owned().await {
            Ok(permit) => {
                self.in_flight.spawn(async move {
                    execute(engine, index, batch, retry, stats).await;
                    drop(permit);
                });
            }
            // The semaphore is never closed; fall back to sending inline.
            Err(_) => execute(engine, index, batch, retry, stats).await,
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("[BULK {}] bulk task ended abnormally: {}", self.index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::error::EngineError;
    use crate::types::REQUEST_OVERHEAD_BYTES;
    use serde_json::json;

    fn config(flush_bytes: usize) -> BulkConfig {
        BulkConfig::default()
            .with_flush_bytes(flush_bytes)
            .with_backoff(BackoffPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            })
    }

    /// An index action weighing exactly `size` bytes.
    fn action_of_size(id: usize, size: usize) -> WriteAction {
        let filler = "x".repeat(size - REQUEST_OVERHEAD_BYTES - r#"{"f":""}"#.len());
        let action = WriteAction::index("issues", id.to_string(), &json!({ "f": filler }));
        assert_eq!(action.estimated_size(), size);
        action
    }

    #[tokio::test]
    async fn test_seals_when_threshold_reached() {
        let engine = Arc::new(MemoryEngine::new());
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config(1000));

        dispatcher.submit(action_of_size(1, 400)).await;
        dispatcher.submit(action_of_size(2, 400)).await;
        assert!(engine.acknowledged_bulks().is_empty());
        assert_eq!(dispatcher.pending_bytes(), 800);

        dispatcher.submit(action_of_size(3, 200)).await;
        assert_eq!(engine.acknowledged_bulks(), vec![(3, 1000)]);
        assert_eq!(dispatcher.pending_bytes(), 0);

        dispatcher.submit(action_of_size(4, 100)).await;
        dispatcher.flush_and_drain().await;
        assert_eq!(engine.acknowledged_bulks(), vec![(3, 1000), (1, 100)]);
        assert_eq!(dispatcher.stats().processed(), 4);
        assert_eq!(dispatcher.stats().bytes(), 1100);
    }

    #[tokio::test]
    async fn test_retry_counts_batch_once() {
        let engine = Arc::new(MemoryEngine::new());
        engine.script_bulk_errors([
            EngineError::Transport("connection reset".into()),
            EngineError::from_status(429, "es_rejected_execution_exception"),
        ]);
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config(1 << 20));

        for i in 0..5 {
            dispatcher.submit(action_of_size(i, 120)).await;
        }
        dispatcher.flush_and_drain().await;

        let attempts: Vec<_> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                crate::engine::memory::EngineCall::Bulk { batch_id, actions, .. } => {
                    Some((batch_id, actions))
                }
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![(1, 5), (1, 5), (1, 5)]);
        assert_eq!(dispatcher.stats().processed(), 5);
        assert_eq!(dispatcher.stats().batches(), 1);
    }

    #[tokio::test]
    async fn test_permanent_batch_failure_is_counted_not_retried() {
        let engine = Arc::new(MemoryEngine::new());
        engine.script_bulk_errors([EngineError::from_status(400, "illegal_argument_exception")]);
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config(1 << 20));

        dispatcher.submit(action_of_size(1, 100)).await;
        dispatcher.submit(action_of_size(2, 100)).await;
        dispatcher.flush_and_drain().await;

        assert_eq!(dispatcher.stats().processed(), 0);
        assert_eq!(dispatcher.stats().failed_batches(), 1);
        assert_eq!(dispatcher.stats().failed_items(), 2);
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_item_failures_recorded_without_failing_batch() {
        let engine = Arc::new(MemoryEngine::new());
        engine.reject_id("2", "version_conflict_engine_exception");
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config(1 << 20));

        for i in 1..=3 {
            dispatcher.submit(action_of_size(i, 100)).await;
        }
        dispatcher.flush_and_drain().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.processed(), 3);
        assert_eq!(stats.failed_items(), 1);
        assert_eq!(stats.failed_batches(), 0);
        let failures = stats.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "2");
        assert_eq!(failures[0].reason, "version_conflict_engine_exception");
        assert_eq!(engine.document_count("issues"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_is_respected() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_bulk_latency(Duration::from_millis(20));
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 3, &config(100));

        for i in 0..20 {
            dispatcher.submit(action_of_size(i, 100)).await;
            assert!(dispatcher.in_flight() <= 3);
        }
        dispatcher.flush_and_drain().await;

        assert_eq!(engine.acknowledged_bulks().len(), 20);
        assert!(engine.peak_in_flight() <= 3);
        assert!(engine.peak_in_flight() >= 2);
        assert_eq!(dispatcher.stats().processed(), 20);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_mode_never_overlaps() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_bulk_latency(Duration::from_millis(5));
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config(100));

        for i in 0..5 {
            dispatcher.submit(action_of_size(i, 100)).await;
        }
        dispatcher.flush_and_drain().await;
        assert_eq!(engine.peak_in_flight(), 1);
        assert_eq!(engine.acknowledged_bulks().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_engine_gives_up_after_drain_timeout() {
        let engine = Arc::new(MemoryEngine::new());
        engine.script_bulk_errors(
            (0..10_000).map(|_| EngineError::Transport("connection refused".into())),
        );
        let config = BulkConfig::default()
            .with_flush_bytes(1)
            .with_drain_timeout(Duration::from_secs(10));
        let mut dispatcher = BatchDispatcher::new(engine.clone(), "issues", 0, &config);

        let sent = tokio::time::timeout(
            Duration::from_secs(60 * 60),
            dispatcher.submit(action_of_size(1, 100)),
        )
        .await;

        assert!(sent.is_ok());
        assert_eq!(dispatcher.stats().failed_batches(), 1);
        assert_eq!(dispatcher.stats().failed_items(), 1);
        assert_eq!(dispatcher.stats().processed(), 0);
        assert!(engine.calls().len() < 20);
    }
}
