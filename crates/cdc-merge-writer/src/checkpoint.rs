//! Checkpoint storage and coordination
//!
//! `FileCheckpoint` and `MemoryCheckpoint` persist the resume position.
//! `CheckpointCoordinator` owns the committed position for a running engine
//! and guarantees it never moves backwards.

use async_trait::async_trait;
use cdc_merge_core::prelude::*;
use cdc_merge_core::{CheckpointConfig, MergeMetrics};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Build the checkpoint store named by `storage_type`
pub fn checkpoint_from_config(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.storage_type.as_str() {
        "file" => Ok(Arc::new(FileCheckpoint::new(&config.path))),
        "memory" => Ok(Arc::new(MemoryCheckpoint::new())),
        other => Err(SyncError::config(format!(
            "unknown checkpoint storage type: {}",
            other
        ))),
    }
}

// ============================================================================
// File-based Checkpoint
// ============================================================================

/// JSON checkpoint file, replaced atomically on every save
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let checkpoint: Checkpoint =
                    serde_json::from_str(&content).map_err(|e| SyncError::CorruptCheckpoint {
                        message: format!("{}: {}", self.path.display(), e),
                    })?;
                info!(
                    batch_id = checkpoint.batch_id,
                    position = ?checkpoint.position,
                    path = ?self.path,
                    "Loaded checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No checkpoint file, starting from the beginning");
                Ok(None)
            }
            Err(e) => Err(SyncError::checkpoint_unavailable_with_source(
                "Failed to read checkpoint",
                e,
            )),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::checkpoint_unavailable_with_source(
                    "Failed to create checkpoint directory",
                    e,
                )
            })?;
        }

        let content = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| SyncError::Internal(format!("Failed to serialize checkpoint: {}", e)))?;

        // Write atomically via temp file
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content).await.map_err(|e| {
            SyncError::checkpoint_unavailable_with_source("Failed to write checkpoint", e)
        })?;
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            SyncError::checkpoint_unavailable_with_source("Failed to rename checkpoint", e)
        })?;

        debug!(batch_id = checkpoint.batch_id, position = ?checkpoint.position, "Saved checkpoint");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file_checkpoint"
    }
}

// ============================================================================
// Memory Checkpoint (for testing)
// ============================================================================

/// In-memory checkpoint storage
#[derive(Default)]
pub struct MemoryCheckpoint {
    checkpoint: RwLock<Option<Checkpoint>>,
    saves: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make loads and saves fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn get(&self) -> Option<Checkpoint> {
        self.checkpoint.read().await.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::checkpoint_unavailable("memory checkpoint marked unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        self.check_available()?;
        Ok(self.checkpoint.read().await.clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check_available()?;
        *self.checkpoint.write().await = Some(checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_checkpoint"
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Owns the committed checkpoint of one engine
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    timeout: Duration,
    current: RwLock<Option<Checkpoint>>,
    metrics: MergeMetrics,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<dyn CheckpointStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            current: RwLock::new(None),
            metrics: MergeMetrics::new("checkpoint"),
        }
    }

    pub fn with_metrics(mut self, metrics: MergeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Read the durable checkpoint and make it the committed one
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let loaded = tokio::time::timeout(self.timeout, self.store.load())
            .await
            .map_err(|_| {
                SyncError::checkpoint_unavailable(format!(
                    "checkpoint load timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        if let Some(position) = loaded.as_ref().and_then(|c| c.position) {
            self.metrics.set_checkpoint_position(position.offset());
        }
        *self.current.write().await = loaded.clone();
        Ok(loaded)
    }

    pub async fn current(&self) -> Option<Checkpoint> {
        self.current.read().await.clone()
    }

    /// Committed position; every record at or below it has been applied
    pub async fn position(&self) -> Option<SourcePosition> {
        self.current.read().await.as_ref().and_then(|c| c.position)
    }

    /// Durably record `batch_id` with the greater of the committed position
    /// and `candidate`.
    ///
    /// On error the committed checkpoint is unchanged.
    pub async fn commit(
        &self,
        batch_id: u64,
        candidate: Option<SourcePosition>,
    ) -> Result<Checkpoint> {
        let mut current = self.current.write().await;
        let committed = current.as_ref().and_then(|c| c.position);
        let checkpoint = Checkpoint::new(batch_id, committed.max(candidate));

        tokio::time::timeout(self.timeout, self.store.save(&checkpoint))
            .await
            .map_err(|_| {
                SyncError::checkpoint_unavailable(format!(
                    "checkpoint save timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        if let Some(position) = checkpoint.position {
            self.metrics.set_checkpoint_position(position.offset());
        }
        debug!(
            batch_id,
            position = ?checkpoint.position,
            candidate = ?candidate,
            store = self.store.name(),
            "Checkpoint committed"
        );
        *current = Some(checkpoint.clone());
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_checkpoint() {
        let cp = MemoryCheckpoint::new();
        assert!(cp.load().await.unwrap().is_none());

        cp.save(&Checkpoint::new(1, Some(SourcePosition(100)))).await.unwrap();
        let loaded = cp.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, Some(SourcePosition(100)));
        assert_eq!(cp.save_count(), 1);
    }

    #[tokio::test]
    async fn test_file_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoint.json");

        let cp = FileCheckpoint::new(&path);
        assert!(cp.load().await.unwrap().is_none());

        cp.save(&Checkpoint::new(4, Some(SourcePosition(42)))).await.unwrap();
        let loaded = cp.load().await.unwrap().unwrap();
        assert_eq!(loaded.batch_id, 4);
        assert_eq!(loaded.position, Some(SourcePosition(42)));

        // New instance should load persisted value
        let cp2 = FileCheckpoint::new(&path);
        assert_eq!(cp2.load().await.unwrap().unwrap().position, Some(SourcePosition(42)));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileCheckpoint::new(&path).load().await.unwrap_err();
        assert!(matches!(err, SyncError::CorruptCheckpoint { .. }));
    }

    #[tokio::test]
    async fn test_commit_never_regresses() {
        let store = Arc::new(MemoryCheckpoint::new());
        let coordinator = CheckpointCoordinator::new(store.clone(), Duration::from_secs(1));
        assert!(coordinator.load().await.unwrap().is_none());

        coordinator.commit(1, Some(SourcePosition(10))).await.unwrap();
        let cp = coordinator.commit(2, Some(SourcePosition(7))).await.unwrap();
        assert_eq!(cp.batch_id, 2);
        assert_eq!(cp.position, Some(SourcePosition(10)));

        // Empty batch keeps the position but records the batch
        let cp = coordinator.commit(3, None).await.unwrap();
        assert_eq!(cp.position, Some(SourcePosition(10)));
        assert_eq!(store.get().await.unwrap().batch_id, 3);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_previous() {
        let store = Arc::new(MemoryCheckpoint::new());
        let coordinator = CheckpointCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.commit(1, Some(SourcePosition(5))).await.unwrap();

        store.set_unavailable(true);
        let err = coordinator.commit(2, Some(SourcePosition(9))).await.unwrap_err();
        assert!(matches!(err, SyncError::CheckpointStoreUnavailable { .. }));
        assert_eq!(coordinator.position().await, Some(SourcePosition(5)));
        assert_eq!(coordinator.current().await.unwrap().batch_id, 1);
    }

    #[test]
    fn test_checkpoint_from_config() {
        let config = CheckpointConfig {
            storage_type: "memory".into(),
            ..Default::default()
        };
        assert_eq!(checkpoint_from_config(&config).unwrap().name(), "memory_checkpoint");

        let config = CheckpointConfig {
            storage_type: "redis".into(),
            ..Default::default()
        };
        assert!(checkpoint_from_config(&config).is_err());
    }
}
