//! Merge engine: the per-batch entry point
//!
//! ```text
//! Batch ──► replay filter ──► decode ──► plan ──► apply ──► checkpoint
//!                               │                   │
//!                               └──── DLQ ◄─────────┘
//! ```
//!
//! A batch either finishes with a committed checkpoint or returns an error
//! and commits nothing. Store writes issued before the error are not rolled
//! back; re-running the batch is safe because every write is idempotent.

use crate::applier::StoreApplier;
use crate::checkpoint::CheckpointCoordinator;
use crate::dlq::{DeadLetterQueue, DlqEntry};
use cdc_merge_core::prelude::*;
use cdc_merge_core::{ErrorContext, ErrorContextExt, MergeMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What happened to one batch
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub batch_id: u64,
    /// Raw changes delivered in the batch
    pub received: usize,
    pub decoded: usize,
    pub rejected: usize,
    pub tombstones: usize,
    /// Records skipped because the checkpoint already covered them
    pub replayed: usize,
    pub planned_upserts: usize,
    pub planned_deletes: usize,
    pub superseded: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Every entry that failed, dead-lettered ones included
    pub failures: Vec<EntryFailure>,
    /// Rejected records and failed entries written to the DLQ
    pub dead_lettered: usize,
    /// Committed position after this batch
    pub checkpoint: Option<SourcePosition>,
    /// Whether failed entries kept the checkpoint below the batch maximum
    pub held_back: bool,
    pub duration: Duration,
}

impl BatchOutcome {
    fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            ..Default::default()
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Decodes, plans, applies and checkpoints batches against one collection
pub struct MergeEngine<S: DocumentStore> {
    decoder: EnvelopeDecoder,
    planner: MergePlanner,
    applier: StoreApplier<S>,
    coordinator: CheckpointCoordinator,
    dlq: Option<Arc<DeadLetterQueue>>,
    skip_applied: bool,
    metrics: MergeMetrics,
    /// Serializes batches; `true` once the checkpoint has been loaded
    started: Mutex<bool>,
}

impl<S: DocumentStore> MergeEngine<S> {
    pub fn new(
        decoder: EnvelopeDecoder,
        planner: MergePlanner,
        applier: StoreApplier<S>,
        coordinator: CheckpointCoordinator,
    ) -> Self {
        Self {
            decoder,
            planner,
            applier,
            coordinator,
            dlq: None,
            skip_applied: true,
            metrics: MergeMetrics::new("engine"),
            started: Mutex::new(false),
        }
    }

    pub fn from_config(
        store: Arc<S>,
        checkpoint: Arc<dyn CheckpointStore>,
        config: &SyncConfig,
    ) -> Self {
        let applier = StoreApplier::from_config(store, config);
        let coordinator = CheckpointCoordinator::new(checkpoint, config.checkpoint.timeout);

        let mut engine = Self::new(
            EnvelopeDecoder::new(config.decoder.key_fields.clone()),
            MergePlanner::new(config.planner.ordering),
            applier,
            coordinator,
        )
        .with_skip_applied(config.engine.skip_applied);

        if let Some(dlq) = DeadLetterQueue::from_config(&config.dlq) {
            engine = engine.with_dlq(Arc::new(dlq));
        }
        engine
    }

    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Drop records at or below the loaded checkpoint before planning
    pub fn with_skip_applied(mut self, skip_applied: bool) -> Self {
        self.skip_applied = skip_applied;
        self
    }

    pub fn applier(&self) -> &StoreApplier<S> {
        &self.applier
    }

    pub fn dlq(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.coordinator.current().await
    }

    /// Load the durable checkpoint and return the resume position.
    ///
    /// Delivery should restart strictly after the returned position.
    pub async fn start(&self) -> Result<Option<SourcePosition>> {
        let mut started = self.started.lock().await;
        self.load(&mut started).await
    }

    async fn load(&self, started: &mut bool) -> Result<Option<SourcePosition>> {
        let checkpoint = self
            .coordinator
            .load()
            .await
            .with_context(ErrorContext::new("engine", "load_checkpoint"))?;
        *started = true;

        let position = checkpoint.as_ref().and_then(|c| c.position);
        info!(
            store = self.coordinator.store_name(),
            batch_id = checkpoint.as_ref().map(|c| c.batch_id),
            position = ?position,
            "Merge engine started"
        );
        Ok(position)
    }

    /// Process one batch end to end.
    ///
    /// Concurrent calls are processed one at a time in call order.
    pub async fn apply(&self, batch: Batch) -> Result<BatchOutcome> {
        let mut started = self.started.lock().await;
        if !*started {
            self.load(&mut started).await?;
        }

        let start = Instant::now();
        let batch_id = batch.id;
        let result = self
            .process(batch)
            .await
            .with_context(ErrorContext::new("engine", "apply").with_batch(batch_id));
        self.metrics.record_batch_latency(start.elapsed());

        match result {
            Ok(mut outcome) => {
                outcome.duration = start.elapsed();
                self.metrics
                    .record_batch(if outcome.held_back { "held_back" } else { "ok" });
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_batch("failed");
                Err(e)
            }
        }
    }

    async fn process(&self, batch: Batch) -> Result<BatchOutcome> {
        let batch_id = batch.id;
        let mut outcome = BatchOutcome::new(batch_id);
        outcome.received = batch.len();

        let positions: Vec<SourcePosition> = batch.iter().map(|c| c.position).collect();
        let applied_through = if self.skip_applied {
            self.coordinator.position().await
        } else {
            None
        };

        let mut records = Vec::with_capacity(batch.len());
        for raw in batch.iter() {
            if applied_through.is_some_and(|p| raw.position <= p) {
                outcome.replayed += 1;
                continue;
            }
            match self.decoder.decode(raw) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => outcome.tombstones += 1,
                Err(e) => {
                    outcome.rejected += 1;
                    if self.reject(batch_id, raw, &e).await {
                        outcome.dead_lettered += 1;
                    }
                }
            }
        }
        outcome.decoded = records.len();
        self.metrics.record_decoded(outcome.decoded as u64);
        self.metrics.record_replayed(outcome.replayed as u64);
        self.metrics.record_tombstones(outcome.tombstones as u64);

        let plan = self.planner.plan(records);
        outcome.planned_upserts = plan.upsert_count();
        outcome.planned_deletes = plan.delete_count();
        outcome.superseded = plan.superseded_count();
        self.metrics.record_plan(
            outcome.planned_upserts,
            outcome.planned_deletes,
            outcome.superseded,
        );

        let report = self.applier.apply(&plan).await?;
        outcome.upserted = report.upserted;
        outcome.deleted = report.deleted;

        // Earliest position that must be redelivered
        let mut cap: Option<SourcePosition> = None;
        if !report.failures.is_empty() {
            let entries: HashMap<&EntityKey, &PlanEntry> =
                plan.entries().iter().map(|e| (&e.key, e)).collect();
            for failure in &report.failures {
                let Some(entry) = entries.get(&failure.key) else {
                    warn!(batch_id, key = %failure.key, "Store reported a failure for an unplanned key");
                    continue;
                };
                if !failure.retryable && self.accept(batch_id, entry, failure).await {
                    outcome.dead_lettered += 1;
                    continue;
                }
                cap = Some(cap.map_or(entry.first_position, |c| c.min(entry.first_position)));
            }
        }
        outcome.failures = report.failures;

        let candidate = match cap {
            None => positions.iter().max().copied(),
            Some(cap) => {
                outcome.held_back = true;
                positions.iter().filter(|p| **p < cap).max().copied()
            }
        };

        let checkpoint = self
            .coordinator
            .commit(batch_id, candidate)
            .await
            .with_context(ErrorContext::new("engine", "commit").with_batch(batch_id))?;
        outcome.checkpoint = checkpoint.position;

        if outcome.held_back {
            self.metrics.record_checkpoint_held_back();
            warn!(
                batch_id,
                failed = outcome.failed(),
                cap = ?cap,
                checkpoint = ?outcome.checkpoint,
                "Checkpoint held back by failed entries"
            );
        }
        if let Some(ref dlq) = self.dlq {
            self.metrics.set_dlq_size(dlq.len().await);
        }

        debug!(
            batch_id,
            received = outcome.received,
            decoded = outcome.decoded,
            rejected = outcome.rejected,
            replayed = outcome.replayed,
            upserts = outcome.planned_upserts,
            deletes = outcome.planned_deletes,
            superseded = outcome.superseded,
            failed = outcome.failed(),
            checkpoint = ?outcome.checkpoint,
            "Batch applied"
        );
        Ok(outcome)
    }

    /// Log and dead-letter a record the decoder rejected
    async fn reject(&self, batch_id: u64, raw: &RawChange, error: &SyncError) -> bool {
        warn!(
            batch_id,
            position = %raw.position,
            kind = error.kind(),
            error = %error,
            "Dropping undecodable record"
        );
        self.metrics.record_rejected(error.kind());

        let Some(ref dlq) = self.dlq else {
            return false;
        };
        match dlq.add(DlqEntry::rejected(batch_id, raw, error)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(batch_id, position = %raw.position, error = %e, "Failed to dead-letter record");
                false
            }
        }
    }

    /// Dead-letter a permanently failed entry; `true` means it no longer
    /// holds back the checkpoint
    async fn accept(&self, batch_id: u64, entry: &PlanEntry, failure: &EntryFailure) -> bool {
        let Some(ref dlq) = self.dlq else {
            return false;
        };
        match dlq.add(DlqEntry::failed(batch_id, entry, failure)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(batch_id, key = %entry.key, error = %e, "Failed to dead-letter entry");
                false
            }
        }
    }
}
