//! In-memory document store
//!
//! Implements the `DocumentStore` strategy over a map, with failure injection
//! so tests can exercise partial failures and outages.

use async_trait::async_trait;
use cdc_merge_core::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

/// Injected failure for one document id
#[derive(Debug, Clone)]
struct InjectedFailure {
    reason: String,
    retryable: bool,
    /// Remaining failing attempts; `None` fails forever
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, HashMap<String, Value>>,
    failures: HashMap<String, InjectedFailure>,
    /// Successful writes (upsert or delete) per document id
    writes: HashMap<String, u32>,
    requests: u64,
}

impl State {
    /// Consume one injected failure for `id`, if any is armed
    fn take_failure(&mut self, key: &EntityKey) -> Option<EntryFailure> {
        let id = key.document_id();
        let failure = self.failures.get_mut(&id)?;
        if failure.remaining == Some(0) {
            self.failures.remove(&id);
            return None;
        }
        let result = EntryFailure {
            key: key.clone(),
            reason: failure.reason.clone(),
            retryable: failure.retryable,
        };
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        if failure.remaining == Some(0) {
            self.failures.remove(&id);
        }
        Some(result)
    }
}

/// Map-backed document store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    running: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail at the transport level
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject writes to `key` for the next `times` attempts (`None`: always)
    pub async fn fail_key(
        &self,
        key: &EntityKey,
        reason: impl Into<String>,
        retryable: bool,
        times: Option<u32>,
    ) {
        self.state.lock().await.failures.insert(
            key.document_id(),
            InjectedFailure {
                reason: reason.into(),
                retryable,
                remaining: times,
            },
        );
    }

    /// Remove every injected entry failure
    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    pub async fn get(&self, collection: &str, key: &EntityKey) -> Option<Value> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .and_then(|docs| docs.get(&key.document_id()))
            .cloned()
    }

    pub async fn contains(&self, collection: &str, key: &EntityKey) -> bool {
        self.get(collection, key).await.is_some()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map_or(0, HashMap::len)
    }

    /// Full contents of a collection, for state comparisons in tests
    pub async fn snapshot(&self, collection: &str) -> HashMap<String, Value> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of successful writes that touched `key`
    pub async fn write_count(&self, key: &EntityKey) -> u32 {
        self.state
            .lock()
            .await
            .writes
            .get(&key.document_id())
            .copied()
            .unwrap_or(0)
    }

    /// Number of bulk requests received, failed ones included
    pub async fn request_count(&self) -> u64 {
        self.state.lock().await.requests
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::store_unavailable("memory store marked unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Lifecycle for MemoryStore {
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
impl HealthCheck for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }

    fn component_name(&self) -> &'static str {
        "memory_store"
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bulk_upsert(&self, collection: &str, entries: &[&PlanEntry]) -> Result<BulkReport> {
        let mut state = self.state.lock().await;
        state.requests += 1;
        self.check_available()?;

        let mut report = BulkReport::success(0);
        for entry in entries {
            if let Some(failure) = state.take_failure(&entry.key) {
                report.failures.push(failure);
                continue;
            }
            let Some(document) = entry.document() else {
                report
                    .failures
                    .push(EntryFailure::permanent(entry.key.clone(), "upsert without document"));
                continue;
            };
            let id = entry.key.document_id();
            trace!(collection, id = %id, "Upserting document");
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.clone(), document.clone());
            *state.writes.entry(id).or_default() += 1;
        }
        Ok(report)
    }

    async fn bulk_delete(&self, collection: &str, keys: &[&EntityKey]) -> Result<BulkReport> {
        let mut state = self.state.lock().await;
        state.requests += 1;
        self.check_available()?;

        let mut report = BulkReport::success(0);
        for key in keys {
            if let Some(failure) = state.take_failure(key) {
                report.failures.push(failure);
                continue;
            }
            let id = key.document_id();
            trace!(collection, id = %id, "Deleting document");
            if let Some(docs) = state.collections.get_mut(collection) {
                docs.remove(&id);
            }
            *state.writes.entry(id).or_default() += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_merge_core::MergePlanner;
    use serde_json::json;

    fn plan_for(records: Vec<ChangeRecord>) -> OperationPlan {
        MergePlanner::default().plan(records)
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let store = MemoryStore::new();
        let plan = plan_for(vec![ChangeRecord::upsert(
            ChangeOperation::Create,
            1i64,
            json!({"id": 1, "name": "A"}),
            1,
        )]);
        let entries: Vec<_> = plan.upserts().collect();
        let report = store.bulk_upsert("users", &entries).await.unwrap();
        assert!(report.is_complete_success());
        assert_eq!(store.get("users", &EntityKey::Int(1)).await.unwrap()["name"], "A");

        let key = EntityKey::Int(1);
        store.bulk_delete("users", &[&key]).await.unwrap();
        assert!(!store.contains("users", &key).await);

        // Deleting an absent document is not an error
        let report = store.bulk_delete("users", &[&key]).await.unwrap();
        assert!(report.is_complete_success());
    }

    #[tokio::test]
    async fn test_injected_failure_expires() {
        let store = MemoryStore::new();
        let key = EntityKey::Int(9);
        store.fail_key(&key, "throttled", true, Some(1)).await;

        let report = store.bulk_delete("users", &[&key]).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].retryable);

        let report = store.bulk_delete("users", &[&key]).await.unwrap();
        assert!(report.is_complete_success());
        assert_eq!(store.write_count(&key).await, 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let key = EntityKey::Int(1);
        let err = store.bulk_delete("users", &[&key]).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable { .. }));
        assert!(store.health_check().await.is_err());
        assert_eq!(store.request_count().await, 1);
    }
}
