//! # CDC Merge Core
//!
//! Core types, decoding, planning and strategy traits for applying a
//! change-data-capture stream to a document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Envelope   │───►│ Batch Merge  │───►│ Target Store │───►│  Checkpoint  │
//! │   Decoder    │    │   Planner    │    │   Applier    │    │ Coordinator  │
//! └──────────────┘    └──────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! This crate holds the pure stages (decoder, planner) and the traits the
//! I/O stages are written against. The applier, checkpoint coordinator and
//! engine live in `cdc-merge-writer`.

pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod planner;
pub mod record;
pub mod strategy;

pub use self::config::*;
pub use envelope::*;
pub use error::*;
pub use self::metrics::*;
pub use planner::*;
pub use record::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::envelope::EnvelopeDecoder;
    pub use crate::error::{Result, SyncError};
    pub use crate::planner::{MergePlanner, OperationPlan, OrderingMode, PlanAction, PlanEntry};
    pub use crate::record::{
        Batch, ChangeOperation, ChangeRecord, EntityKey, RawChange, SourcePosition,
    };
    pub use crate::strategy::{
        BulkReport, ChangeFeed, Checkpoint, CheckpointStore, DocumentStore, EntryFailure,
        HealthCheck, Lifecycle,
    };
}
