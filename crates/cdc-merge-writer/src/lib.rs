//! # CDC Merge Writer
//!
//! Applies a change-data-capture stream from NATS JetStream to an
//! Elasticsearch-compatible document store, one merged batch at a time.
//!
//! ## Components
//!
//! - `MergeEngine`: decode, plan, apply and checkpoint a batch
//! - `StoreApplier`: bulk writes with per-entry retry
//! - `CheckpointCoordinator`: monotonic, durable resume position
//! - `JetStreamFeed`: durable pull consumer delivering raw changes
//! - `SyncRunner`: fetch/apply/settle loop with graceful shutdown
//!
//! ## Guarantees
//!
//! - At-least-once delivery, made effectively-once by idempotent writes
//! - The checkpoint never passes an entry that failed and was not accepted
//! - Permanently failed entries and undecodable records go to the DLQ

pub mod applier;
pub mod bulk_store;
pub mod checkpoint;
pub mod consumer;
pub mod dlq;
pub mod engine;
pub mod memory_store;
pub mod retry;

pub use applier::*;
pub use bulk_store::*;
pub use checkpoint::*;
pub use consumer::*;
pub use dlq::*;
pub use engine::*;
pub use memory_store::*;
pub use retry::*;

use cdc_merge_core::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Main sync orchestrator
pub struct SyncRunner<F, S>
where
    F: ChangeFeed,
    S: DocumentStore,
{
    feed: Arc<F>,
    engine: Arc<MergeEngine<S>>,
    batch_size: usize,
    backoff: RetryPolicy,
    running: AtomicBool,
    shutdown: Notify,
    batches: AtomicU64,
    failed: AtomicU64,
}

impl<F, S> SyncRunner<F, S>
where
    F: ChangeFeed + 'static,
    S: DocumentStore + 'static,
{
    pub fn new(
        feed: Arc<F>,
        engine: Arc<MergeEngine<S>>,
        batch_size: usize,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            feed,
            engine,
            batch_size: batch_size.max(1),
            backoff,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            batches: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn from_config(feed: Arc<F>, engine: Arc<MergeEngine<S>>, config: &SyncConfig) -> Self {
        Self::new(
            feed,
            engine,
            config.feed.batch_size,
            RetryPolicy::from(&config.apply.retry),
        )
    }

    /// Run until Ctrl-C or `stop()`
    pub async fn run(&self) -> Result<()> {
        info!("Starting sync runner");

        let resume = self.engine.start().await?;
        self.engine.applier().store().start().await?;
        self.feed.resume_after(resume).await?;
        self.feed.start().await?;
        self.running.store(true, Ordering::SeqCst);

        let mut batch_id = self.engine.checkpoint().await.map_or(0, |c| c.batch_id);
        let mut consecutive_failures = 0u32;

        while self.running.load(Ordering::SeqCst) {
            // Shutdown only interrupts the fetch; a fetched batch always
            // runs to its settle.
            let fetched = tokio::select! {
                result = self.feed.fetch(self.batch_size) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = self.shutdown.notified() => {
                    info!("Stop requested");
                    break;
                }
            };

            let result = match fetched {
                Ok(changes) if changes.is_empty() => continue,
                Ok(changes) => self.process(batch_id + 1, changes).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    batch_id = outcome.batch_id;
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.backoff.delay(consecutive_failures);
                    error!(
                        error = %e,
                        kind = e.kind(),
                        batch_id = batch_id + 1,
                        consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Batch failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.notified() => break,
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.feed.stop().await?;
        self.engine.applier().store().stop().await?;

        let checkpoint = self.engine.checkpoint().await.and_then(|c| c.position);
        info!(
            batches = self.batch_count(),
            failed = self.failed_count(),
            checkpoint = ?checkpoint,
            "Sync runner stopped"
        );
        Ok(())
    }

    /// Apply and settle one fetched batch
    async fn process(&self, batch_id: u64, changes: Vec<RawChange>) -> Result<BatchOutcome> {
        debug!(batch_id, count = changes.len(), "Processing batch");
        match self.engine.apply(Batch::new(batch_id, changes)).await {
            Ok(outcome) => {
                self.batches.fetch_add(1, Ordering::Relaxed);
                self.feed.settle(outcome.checkpoint).await?;
                Ok(outcome)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let committed = self.engine.checkpoint().await.and_then(|c| c.position);
                if let Err(settle_err) = self.feed.settle(committed).await {
                    warn!(error = %settle_err, "Failed to settle failed batch");
                }
                Err(e)
            }
        }
    }

    /// Stop the runner. A batch already fetched is applied and settled
    /// first; a pending fetch is abandoned and its records are redelivered.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Batches applied successfully
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Batches that failed and were redelivered
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Feed that redelivers whatever a settle leaves uncommitted
    #[derive(Default)]
    struct QueueFeed {
        queue: Mutex<VecDeque<RawChange>>,
        inflight: Mutex<Vec<RawChange>>,
        resume: Mutex<Option<SourcePosition>>,
        running: AtomicBool,
    }

    impl QueueFeed {
        fn with_changes(changes: Vec<RawChange>) -> Self {
            Self {
                queue: Mutex::new(changes.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Lifecycle for QueueFeed {
        async fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthCheck for QueueFeed {
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
        fn component_name(&self) -> &'static str {
            "queue_feed"
        }
    }

    #[async_trait]
    impl ChangeFeed for QueueFeed {
        async fn resume_after(&self, position: Option<SourcePosition>) -> Result<()> {
            *self.resume.lock().await = position;
            Ok(())
        }

        async fn fetch(&self, max_records: usize) -> Result<Vec<RawChange>> {
            let mut queue = self.queue.lock().await;
            let take = max_records.min(queue.len());
            let changes: Vec<RawChange> = queue.drain(..take).collect();
            drop(queue);

            if changes.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            *self.inflight.lock().await = changes.clone();
            Ok(changes)
        }

        async fn settle(&self, committed: Option<SourcePosition>) -> Result<()> {
            let inflight = std::mem::take(&mut *self.inflight.lock().await);
            let mut queue = self.queue.lock().await;
            for change in inflight.into_iter().rev() {
                if !committed.is_some_and(|c| change.position <= c) {
                    queue.push_front(change);
                }
            }
            Ok(())
        }
    }

    fn change(pos: u64, op: &str, id: i64) -> RawChange {
        RawChange::from_json(pos, &json!({"op": op, "after": {"id": id, "v": pos}}))
    }

    fn engine(store: Arc<MemoryStore>) -> Arc<MergeEngine<MemoryStore>> {
        let applier = StoreApplier::new(
            store,
            "users",
            RetryPolicy::immediate(1),
            Duration::from_secs(5),
        );
        Arc::new(MergeEngine::new(
            EnvelopeDecoder::default(),
            MergePlanner::default(),
            applier,
            CheckpointCoordinator::new(Arc::new(MemoryCheckpoint::new()), Duration::from_secs(5)),
        ))
    }

    async fn wait_until<Fut>(mut condition: impl FnMut() -> Fut)
    where
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_runner_applies_batches_until_stopped() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let feed = Arc::new(QueueFeed::with_changes(vec![
            change(1, "c", 1),
            change(2, "c", 2),
            change(3, "u", 1),
            change(4, "c", 3),
            change(5, "u", 3),
        ]));
        let runner = Arc::new(SyncRunner::new(
            feed.clone(),
            engine.clone(),
            2,
            RetryPolicy::immediate(1),
        ));

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };

        wait_until(|| {
            let engine = engine.clone();
            async move { engine.checkpoint().await.and_then(|c| c.position) == Some(SourcePosition(5)) }
        })
        .await;
        runner.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(runner.batch_count(), 3);
        assert_eq!(store.len("users").await, 3);
        assert_eq!(store.get("users", &EntityKey::Int(1)).await.unwrap()["v"], 3);
        assert!(!feed.is_running());
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_failed_batch_is_redelivered() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let engine = engine(store.clone());
        let feed = Arc::new(QueueFeed::with_changes(vec![change(1, "c", 1), change(2, "c", 2)]));
        let backoff = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
        };
        let runner = Arc::new(SyncRunner::new(feed.clone(), engine.clone(), 10, backoff));

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };

        wait_until(|| {
            let runner = runner.clone();
            async move { runner.failed_count() >= 1 }
        })
        .await;
        assert!(engine.checkpoint().await.is_none());

        store.set_unavailable(false);
        wait_until(|| {
            let engine = engine.clone();
            async move { engine.checkpoint().await.and_then(|c| c.position) == Some(SourcePosition(2)) }
        })
        .await;
        runner.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(store.len("users").await, 2);
    }

    /// Store whose writes wait for a permit
    struct GatedStore {
        inner: MemoryStore,
        gate: tokio::sync::Semaphore,
        entered: AtomicBool,
    }

    #[async_trait]
    impl Lifecycle for GatedStore {
        async fn start(&self) -> Result<()> {
            self.inner.start().await
        }
        async fn stop(&self) -> Result<()> {
            self.inner.stop().await
        }
        fn is_running(&self) -> bool {
            self.inner.is_running()
        }
    }

    #[async_trait]
    impl HealthCheck for GatedStore {
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
        fn component_name(&self) -> &'static str {
            "gated_store"
        }
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn bulk_upsert(&self, collection: &str, entries: &[&PlanEntry]) -> Result<BulkReport> {
            self.entered.store(true, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SyncError::store_unavailable(e.to_string()))?;
            self.inner.bulk_upsert(collection, entries).await
        }
        async fn bulk_delete(&self, collection: &str, keys: &[&EntityKey]) -> Result<BulkReport> {
            self.inner.bulk_delete(collection, keys).await
        }
    }

    #[tokio::test]
    async fn test_stop_finishes_batch_in_flight() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: tokio::sync::Semaphore::new(0),
            entered: AtomicBool::new(false),
        });
        let applier = StoreApplier::new(
            store.clone(),
            "users",
            RetryPolicy::immediate(1),
            Duration::from_secs(5),
        );
        let engine = Arc::new(MergeEngine::new(
            EnvelopeDecoder::default(),
            MergePlanner::default(),
            applier,
            CheckpointCoordinator::new(Arc::new(MemoryCheckpoint::new()), Duration::from_secs(5)),
        ));
        let feed = Arc::new(QueueFeed::with_changes(vec![change(1, "c", 1), change(2, "c", 2)]));
        let runner = Arc::new(SyncRunner::new(
            feed.clone(),
            engine.clone(),
            10,
            RetryPolicy::immediate(1),
        ));

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };

        wait_until(|| {
            let store = store.clone();
            async move { store.entered.load(Ordering::SeqCst) }
        })
        .await;
        runner.stop();
        store.gate.add_permits(10);
        handle.await.unwrap().unwrap();

        assert_eq!(runner.batch_count(), 1);
        assert_eq!(
            engine.checkpoint().await.and_then(|c| c.position),
            Some(SourcePosition(2))
        );
        assert_eq!(store.inner.len("users").await, 2);
        assert!(feed.inflight.lock().await.is_empty());
        assert!(feed.queue.lock().await.is_empty());
    }
}
