//! Target store applier
//!
//! Executes an operation plan against a `DocumentStore`. Upserts and deletes
//! go out as two concurrent bulk requests. Entries the store rejects with a
//! retryable reason are resubmitted on their own, with backoff; the rest of
//! the set is never rewritten.

use crate::retry::RetryPolicy;
use cdc_merge_core::prelude::*;
use cdc_merge_core::{LatencyTimer, MergeMetrics, SyncConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of applying one plan
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Entries that still failed after the retry budget was spent
    pub failures: Vec<EntryFailure>,
    /// Bulk requests issued, across both actions
    pub requests: u32,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.upserted + self.deleted
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, key: &EntityKey) -> Option<&EntryFailure> {
        self.failures.iter().find(|f| &f.key == key)
    }
}

#[derive(Debug, Default)]
struct SetOutcome {
    applied: usize,
    failures: Vec<EntryFailure>,
    requests: u32,
}

/// Applies operation plans to a document store
pub struct StoreApplier<S: DocumentStore> {
    store: Arc<S>,
    collection: String,
    retry: RetryPolicy,
    store_timeout: Duration,
    metrics: MergeMetrics,
}

impl<S: DocumentStore> StoreApplier<S> {
    pub fn new(
        store: Arc<S>,
        collection: impl Into<String>,
        retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            retry,
            store_timeout,
            metrics: MergeMetrics::new("applier"),
        }
    }

    pub fn from_config(store: Arc<S>, config: &SyncConfig) -> Self {
        Self::new(
            store,
            config.engine.collection.clone(),
            RetryPolicy::from(&config.apply.retry),
            config.apply.store_timeout,
        )
    }

    pub fn with_metrics(mut self, metrics: MergeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Apply every entry of `plan`.
    ///
    /// Per-entry failures are reported in the `ApplyReport`. An `Err` means
    /// the store could not be reached at all and nothing in the plan may be
    /// considered applied.
    pub async fn apply(&self, plan: &OperationPlan) -> Result<ApplyReport> {
        let start = Instant::now();
        if plan.is_empty() {
            return Ok(ApplyReport::default());
        }

        let upserts: Vec<&PlanEntry> = plan.upserts().collect();
        let deletes: Vec<&PlanEntry> = plan.deletes().collect();

        let (upserted, deleted) = tokio::join!(
            self.apply_set("upsert", upserts),
            self.apply_set("delete", deletes)
        );
        let upserted = upserted?;
        let deleted = deleted?;

        let mut failures = upserted.failures;
        failures.extend(deleted.failures);

        let report = ApplyReport {
            upserted: upserted.applied,
            deleted: deleted.applied,
            failures,
            requests: upserted.requests + deleted.requests,
            duration: start.elapsed(),
        };
        debug!(
            collection = %self.collection,
            upserted = report.upserted,
            deleted = report.deleted,
            failed = report.failures.len(),
            requests = report.requests,
            duration_ms = report.duration.as_millis() as u64,
            "Plan applied"
        );
        Ok(report)
    }

    async fn apply_set(&self, action: &'static str, entries: Vec<&PlanEntry>) -> Result<SetOutcome> {
        let mut outcome = SetOutcome::default();
        let mut pending = entries;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            attempt += 1;
            outcome.requests += 1;

            let timer = LatencyTimer::start(|d| self.metrics.record_store_latency(d));
            let result = self.submit(action, &pending).await;
            timer.stop();

            let report = match result {
                Ok(report) => report,
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    warn!(
                        action,
                        attempt,
                        entries = pending.len(),
                        error = %e,
                        "Bulk request failed, retrying"
                    );
                    self.metrics.record_retry(action);
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut rejected: HashMap<EntityKey, EntryFailure> = report
                .failures
                .into_iter()
                .map(|f| (f.key.clone(), f))
                .collect();

            let mut retry = Vec::new();
            for entry in pending {
                match rejected.remove(&entry.key) {
                    None => outcome.applied += 1,
                    Some(failure) if failure.retryable && self.retry.should_retry(attempt) => {
                        retry.push(entry)
                    }
                    Some(failure) => {
                        let reason = if failure.retryable { "exhausted" } else { "permanent" };
                        self.metrics.record_failed(1, &self.collection, reason);
                        warn!(
                            action,
                            key = %failure.key,
                            retryable = failure.retryable,
                            attempts = attempt,
                            reason = %failure.reason,
                            "Entry failed"
                        );
                        outcome.failures.push(failure);
                    }
                }
            }

            if !retry.is_empty() {
                debug!(action, attempt, entries = retry.len(), "Resubmitting rejected entries");
                self.metrics.record_retry(action);
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
            pending = retry;
        }

        if outcome.applied > 0 {
            self.metrics
                .record_applied(outcome.applied as u64, &self.collection, action);
        }
        Ok(outcome)
    }

    /// One bulk request, bounded by the store timeout
    async fn submit(&self, action: &'static str, pending: &[&PlanEntry]) -> Result<BulkReport> {
        let call = async {
            if action == "upsert" {
                self.store.bulk_upsert(&self.collection, pending).await
            } else {
                let keys: Vec<&EntityKey> = pending.iter().map(|e| &e.key).collect();
                self.store.bulk_delete(&self.collection, &keys).await
            }
        };

        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::store_unavailable(format!(
                "bulk {} timed out after {}ms",
                action,
                self.store_timeout.as_millis()
            ))),
        }
    }
}
