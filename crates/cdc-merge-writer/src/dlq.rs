//! Dead letter queue for rejected records and permanently failed entries

use cdc_merge_core::prelude::*;
use cdc_merge_core::DlqConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why an entry was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqKind {
    /// Raw change the decoder could not turn into a record
    RejectedRecord,
    /// Plan entry the store refused
    FailedEntry,
}

/// Dead letter queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub kind: DlqKind,
    pub batch_id: u64,
    pub position: SourcePosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Stable error label, see `SyncError::kind`
    pub error_kind: String,
    pub reason: String,
    /// Raw payload (rejected records) or planned document (failed upserts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl DlqEntry {
    pub fn rejected(batch_id: u64, raw: &RawChange, error: &SyncError) -> Self {
        let payload = serde_json::from_slice(&raw.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw.payload).into_owned()));
        Self {
            id: Uuid::now_v7().to_string(),
            kind: DlqKind::RejectedRecord,
            batch_id,
            position: raw.position,
            key: None,
            error_kind: error.kind().to_string(),
            reason: error.to_string(),
            payload: Some(payload),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(batch_id: u64, entry: &PlanEntry, failure: &EntryFailure) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind: DlqKind::FailedEntry,
            batch_id,
            position: entry.position,
            key: Some(entry.key.to_string()),
            error_kind: failure.to_error().kind().to_string(),
            reason: failure.reason.clone(),
            payload: entry.document().cloned(),
            timestamp: Utc::now(),
        }
    }
}

/// Dead letter queue, optionally mirrored to a JSON-lines file
pub struct DeadLetterQueue {
    path: Option<PathBuf>,
    max_size: usize,
    entries: RwLock<Vec<DlqEntry>>,
}

impl DeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            path: Some(path.into()),
            max_size,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Queue that keeps entries in memory only
    pub fn in_memory(max_size: usize) -> Self {
        Self {
            path: None,
            max_size,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// `None` when the queue is disabled
    pub fn from_config(config: &DlqConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(&config.path, config.max_size))
    }

    /// Record an entry. Once this returns `Ok` the entry is durable (when
    /// file-backed) and counts as handled.
    pub async fn add(&self, entry: DlqEntry) -> Result<()> {
        if let Some(ref path) = self.path {
            self.append(path, &entry).await?;
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_size {
            warn!(max_size = self.max_size, "DLQ full, dropping oldest entry");
            entries.remove(0);
        }
        debug!(id = %entry.id, kind = ?entry.kind, position = %entry.position, "Dead-lettered");
        entries.push(entry);
        Ok(())
    }

    async fn append(&self, path: &PathBuf, entry: &DlqEntry) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Internal(format!("Failed to create DLQ directory: {}", e)))?;
        }

        let mut line = serde_json::to_string(entry)
            .map_err(|e| SyncError::Internal(format!("Failed to serialize DLQ entry: {}", e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SyncError::Internal(format!("Failed to open DLQ file: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SyncError::Internal(format!("Failed to append DLQ entry: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| SyncError::Internal(format!("Failed to flush DLQ file: {}", e)))?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<DlqEntry> {
        std::mem::take(&mut *self.entries.write().await)
    }

    pub async fn peek(&self, count: usize) -> Vec<DlqEntry> {
        self.entries.read().await.iter().take(count).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bounded_in_memory() {
        let dlq = DeadLetterQueue::in_memory(2);
        let error = SyncError::malformed("unknown op");
        for pos in 1..=3u64 {
            let raw = RawChange::new(pos, "garbage");
            dlq.add(DlqEntry::rejected(1, &raw, &error)).await.unwrap();
        }

        assert_eq!(dlq.len().await, 2);
        let entries = dlq.peek(10).await;
        assert_eq!(entries[0].position, SourcePosition(2));
        assert_eq!(entries[0].payload, Some(Value::String("garbage".into())));
        assert_eq!(entries[0].error_kind, "malformed_envelope");
    }

    #[tokio::test]
    async fn test_file_backed_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq").join("dead.jsonl");
        let dlq = DeadLetterQueue::new(&path, 10);

        let plan = cdc_merge_core::MergePlanner::default().plan(vec![ChangeRecord::upsert(
            ChangeOperation::Create,
            5i64,
            serde_json::json!({"id": 5}),
            9,
        )]);
        let entry = &plan.entries()[0];
        let failure = EntryFailure::permanent(entry.key.clone(), "mapper_parsing_exception");
        dlq.add(DlqEntry::failed(3, entry, &failure)).await.unwrap();
        dlq.add(DlqEntry::failed(3, entry, &failure)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<DlqEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].kind, DlqKind::FailedEntry);
        assert_eq!(lines[0].key.as_deref(), Some("5"));
        assert_eq!(lines[0].error_kind, "store_apply_failure");
        assert_ne!(lines[0].id, lines[1].id);

        assert_eq!(dlq.drain().await.len(), 2);
        assert!(dlq.is_empty().await);
    }
}
