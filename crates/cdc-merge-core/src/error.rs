//! Error types for the CDC merge engine
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for merge engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Primary error type for all merge engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Payload is not a recognizable change envelope
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Neither row image carries the configured primary-key fields
    #[error("Unresolvable key: none of [{fields}] present in after/before image")]
    UnresolvableKey { fields: String },

    /// A single plan entry was rejected by the target store
    #[error("Store apply failure for key {key}: {reason}")]
    StoreApply {
        key: String,
        reason: String,
        retryable: bool,
    },

    /// Target store unreachable or returned a transport-level failure
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Checkpoint storage unreachable or unwritable
    #[error("Checkpoint store unavailable: {message}")]
    CheckpointStoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stored checkpoint exists but cannot be interpreted
    #[error("Corrupt checkpoint: {message}")]
    CorruptCheckpoint { message: String },

    /// Message broker connection or consumer errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a malformed envelope error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
            source: None,
        }
    }

    /// Create a malformed envelope error with source
    pub fn malformed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unresolvable key error for the given key fields
    pub fn unresolvable_key(fields: &[String]) -> Self {
        Self::UnresolvableKey {
            fields: fields.join(", "),
        }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store unavailable error with source
    pub fn store_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a checkpoint store error
    pub fn checkpoint_unavailable(message: impl Into<String>) -> Self {
        Self::CheckpointStoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a checkpoint store error with source
    pub fn checkpoint_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointStoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreApply { retryable, .. } => *retryable,
            Self::StoreUnavailable { .. }
            | Self::CheckpointStoreUnavailable { .. }
            | Self::Transport { .. } => true,
            _ => false,
        }
    }

    /// Check if error concerns a single record rather than the batch.
    ///
    /// Record-level errors drop the record; they never fail a batch.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope { .. } | Self::UnresolvableKey { .. }
        )
    }

    /// Short, stable label used for metrics and dead letter entries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope { .. } => "malformed_envelope",
            Self::UnresolvableKey { .. } => "unresolvable_key",
            Self::StoreApply { .. } => "store_apply_failure",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::CheckpointStoreUnavailable { .. } => "checkpoint_store_unavailable",
            Self::CorruptCheckpoint { .. } => "corrupt_checkpoint",
            Self::Transport { .. } => "transport",
            Self::Configuration { .. } => "configuration",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub batch_id: Option<u64>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            batch_id: None,
        }
    }

    pub fn with_batch(mut self, batch_id: u64) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(batch_id) = self.batch_id {
            write!(f, " batch={}", batch_id)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                kind = e.kind(),
                component = ctx.component,
                operation = %ctx.operation,
                batch_id = ?ctx.batch_id,
                "Operation failed"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::malformed("bad op").is_record_level());
        assert!(SyncError::unresolvable_key(&["id".to_string()]).is_record_level());
        assert!(!SyncError::store_unavailable("down").is_record_level());

        assert!(SyncError::store_unavailable("down").is_retryable());
        assert!(!SyncError::malformed("bad op").is_retryable());

        let permanent = SyncError::StoreApply {
            key: "1".into(),
            reason: "mapper_parsing_exception".into(),
            retryable: false,
        };
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_error_context_display() {
        let ctx = ErrorContext::new("applier", "bulk_upsert").with_batch(7);
        assert_eq!(ctx.to_string(), "[applier::bulk_upsert] batch=7");
    }
}
