//! Strategy traits for the CDC merge engine
//!
//! Each collaborator of the engine (target store, checkpoint storage, change
//! feed) sits behind a trait so implementations can be swapped at compile
//! time and replaced with in-memory doubles in tests.
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     ├── ChangeFeed (delivers raw changes)
//!     │       └── JetStreamFeed, ...
//!     │
//!     └── DocumentStore (bulk writes to target)
//!             └── BulkStore, MemoryStore, ...
//!
//! CheckpointStore (durable resume position)
//!     └── FileCheckpoint, MemoryCheckpoint
//! ```

use crate::error::{Result, SyncError};
use crate::planner::PlanEntry;
use crate::record::{EntityKey, RawChange, SourcePosition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations. Should establish connections.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Target Store
// ============================================================================

/// Per-entry failure reported by a bulk operation
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFailure {
    pub key: EntityKey,
    pub reason: String,
    /// Whether resubmitting the same entry may succeed
    pub retryable: bool,
}

impl EntryFailure {
    pub fn retryable(key: EntityKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(key: EntityKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn to_error(&self) -> SyncError {
        SyncError::StoreApply {
            key: self.key.to_string(),
            reason: self.reason.clone(),
            retryable: self.retryable,
        }
    }
}

/// Result of one bulk request
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    /// Entries the store rejected; every other submitted entry succeeded
    pub failures: Vec<EntryFailure>,
    /// Time the store reports spending on the request
    pub took_ms: u64,
}

impl BulkReport {
    pub fn success(took_ms: u64) -> Self {
        Self {
            failures: Vec::new(),
            took_ms,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Document store strategy - bulk writes against a named collection
///
/// Implementations must treat upserts as full-document replacement keyed by
/// [`EntityKey::document_id`], and deleting an absent key as success, so that
/// re-applying a plan is idempotent.
#[async_trait]
pub trait DocumentStore: Lifecycle + HealthCheck {
    /// Upsert every entry's document in one request.
    ///
    /// Transport-level failure returns `Err`; rejected entries are reported
    /// in the `BulkReport`.
    async fn bulk_upsert(&self, collection: &str, entries: &[&PlanEntry]) -> Result<BulkReport>;

    /// Delete every key in one request
    async fn bulk_delete(&self, collection: &str, keys: &[&EntityKey]) -> Result<BulkReport>;
}

// ============================================================================
// Checkpoint Storage
// ============================================================================

/// Durable marker of the last fully applied stream position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Scheduler batch that produced this checkpoint
    pub batch_id: u64,
    /// Highest applied position; `None` until a non-empty batch commits
    pub position: Option<SourcePosition>,
    pub committed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(batch_id: u64, position: Option<SourcePosition>) -> Self {
        Self {
            batch_id,
            position,
            committed_at: Utc::now(),
        }
    }
}

/// Checkpoint storage trait
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last checkpoint, `None` on first start
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Persist a checkpoint, replacing the previous one atomically
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Get store name
    fn name(&self) -> &'static str;
}

// ============================================================================
// Change Feed
// ============================================================================

/// Change feed strategy - delivers raw changes from the broker
#[async_trait]
pub trait ChangeFeed: Lifecycle + HealthCheck {
    /// Position the feed so delivery starts strictly after `position`.
    ///
    /// Must be called before `start`; `None` means from the beginning.
    async fn resume_after(&self, position: Option<SourcePosition>) -> Result<()>;

    /// Fetch up to `max_records` changes in delivery order.
    ///
    /// An empty vec means nothing arrived within the feed's wait window.
    async fn fetch(&self, max_records: usize) -> Result<Vec<RawChange>>;

    /// Settle the last fetch: everything at or below `committed` is done,
    /// everything above it must be redelivered.
    async fn settle(&self, committed: Option<SourcePosition>) -> Result<()>;
}
