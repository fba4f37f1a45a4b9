//! Metrics for the CDC merge engine
//!
//! Provides Prometheus-compatible metrics for observability.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Decoder metrics
    pub const RECORDS_DECODED: &str = "cdc_merge_records_decoded_total";
    pub const RECORDS_REJECTED: &str = "cdc_merge_records_rejected_total";
    pub const RECORDS_REPLAYED: &str = "cdc_merge_records_replayed_total";
    pub const TOMBSTONES_SKIPPED: &str = "cdc_merge_tombstones_skipped_total";

    // Planner metrics
    pub const PLAN_ENTRIES: &str = "cdc_merge_plan_entries_total";
    pub const RECORDS_SUPERSEDED: &str = "cdc_merge_records_superseded_total";

    // Applier metrics
    pub const ENTRIES_APPLIED: &str = "cdc_merge_entries_applied_total";
    pub const ENTRIES_FAILED: &str = "cdc_merge_entries_failed_total";
    pub const STORE_RETRIES: &str = "cdc_merge_store_retries_total";
    pub const STORE_LATENCY: &str = "cdc_merge_store_latency_seconds";
    pub const DLQ_SIZE: &str = "cdc_merge_dlq_size";

    // Batch and checkpoint metrics
    pub const BATCHES: &str = "cdc_merge_batches_total";
    pub const BATCH_LATENCY: &str = "cdc_merge_batch_latency_seconds";
    pub const CHECKPOINT_POSITION: &str = "cdc_merge_checkpoint_position";
    pub const CHECKPOINT_HELD_BACK: &str = "cdc_merge_checkpoint_held_back_total";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const COLLECTION: &str = "collection";
    pub const ACTION: &str = "action";
    pub const REASON: &str = "reason";
    pub const STATUS: &str = "status";
}

/// Metrics handle shared by the engine's stages
#[derive(Clone)]
pub struct MergeMetrics {
    component: String,
}

impl MergeMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record successfully decoded records
    pub fn record_decoded(&self, count: u64) {
        counter!(
            names::RECORDS_DECODED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    /// Record a dropped record
    pub fn record_rejected(&self, reason: &str) {
        counter!(
            names::RECORDS_REJECTED,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Record records skipped because the checkpoint already covers them
    pub fn record_replayed(&self, count: u64) {
        counter!(
            names::RECORDS_REPLAYED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    pub fn record_tombstones(&self, count: u64) {
        counter!(
            names::TOMBSTONES_SKIPPED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    /// Record plan composition
    pub fn record_plan(&self, upserts: usize, deletes: usize, superseded: usize) {
        counter!(
            names::PLAN_ENTRIES,
            labels::COMPONENT => self.component.clone(),
            labels::ACTION => "upsert",
        )
        .increment(upserts as u64);
        counter!(
            names::PLAN_ENTRIES,
            labels::COMPONENT => self.component.clone(),
            labels::ACTION => "delete",
        )
        .increment(deletes as u64);
        counter!(
            names::RECORDS_SUPERSEDED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(superseded as u64);
    }

    /// Record entries the store accepted
    pub fn record_applied(&self, count: u64, collection: &str, action: &str) {
        counter!(
            names::ENTRIES_APPLIED,
            labels::COMPONENT => self.component.clone(),
            labels::COLLECTION => collection.to_string(),
            labels::ACTION => action.to_string(),
        )
        .increment(count);
    }

    /// Record entries that failed after retries
    pub fn record_failed(&self, count: u64, collection: &str, reason: &str) {
        counter!(
            names::ENTRIES_FAILED,
            labels::COMPONENT => self.component.clone(),
            labels::COLLECTION => collection.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(count);
    }

    /// Record retry
    pub fn record_retry(&self, action: &str) {
        counter!(
            names::STORE_RETRIES,
            labels::COMPONENT => self.component.clone(),
            labels::ACTION => action.to_string(),
        )
        .increment(1);
    }

    /// Record store request latency
    pub fn record_store_latency(&self, duration: Duration) {
        histogram!(
            names::STORE_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Set DLQ size
    pub fn set_dlq_size(&self, size: usize) {
        gauge!(
            names::DLQ_SIZE,
            labels::COMPONENT => self.component.clone(),
        )
        .set(size as f64);
    }

    /// Record a finished batch
    pub fn record_batch(&self, status: &str) {
        counter!(
            names::BATCHES,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Record end-to-end batch latency
    pub fn record_batch_latency(&self, duration: Duration) {
        histogram!(
            names::BATCH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Update the committed checkpoint position
    pub fn set_checkpoint_position(&self, position: u64) {
        gauge!(
            names::CHECKPOINT_POSITION,
            labels::COMPONENT => self.component.clone(),
        )
        .set(position as f64);
    }

    /// Record a batch whose checkpoint was capped by failed entries
    pub fn record_checkpoint_held_back(&self) {
        counter!(
            names::CHECKPOINT_HELD_BACK,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Get elapsed time without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
