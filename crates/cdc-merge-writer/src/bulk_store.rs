//! Bulk document store for Elasticsearch-compatible targets
//!
//! Upserts are `index` actions (full document replacement keyed by `_id`),
//! deletes are `delete` actions. Each call issues exactly one `_bulk`
//! request; retrying is the applier's job.

use async_trait::async_trait;
use cdc_merge_core::prelude::*;
use cdc_merge_core::StoreConfig;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, trace};

/// Elasticsearch-compatible bulk store
pub struct BulkStore {
    client: Client,
    config: StoreConfig,
    host_index: AtomicUsize,
    running: AtomicBool,
}

impl BulkStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(SyncError::config("bulk store needs at least one host"));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::store_unavailable_with_source("Failed to create client", e))?;

        Ok(Self {
            client,
            config,
            host_index: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Next host, round-robin
    fn get_host(&self) -> &str {
        let idx = self.host_index.fetch_add(1, Ordering::Relaxed) % self.config.hosts.len();
        self.config.hosts[idx].trim_end_matches('/')
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.get_host(), path);
        let mut req = self.client.request(method, &url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("ApiKey {}", api_key));
        } else if let (Some(ref user), Some(ref pass)) = (&self.config.username, &self.config.password) {
            req = req.basic_auth(user, Some(pass));
        }

        req
    }

    fn bulk_path(&self) -> &'static str {
        if self.config.refresh {
            "/_bulk?refresh=true"
        } else {
            "/_bulk"
        }
    }

    /// Send one NDJSON body and map item results back onto `keys`
    async fn send_bulk(&self, body: String, keys: &[&EntityKey]) -> Result<BulkReport> {
        let start = Instant::now();

        let resp = self
            .build_request(reqwest::Method::POST, self.bulk_path())
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::store_unavailable_with_source("Bulk request failed", e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(SyncError::store_unavailable(format!(
                "Bulk request returned {}: {}",
                status,
                truncate(&detail, 256)
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::store_unavailable_with_source("Failed to parse bulk response", e))?;

        let report = parse_bulk_response(&body, keys)?;
        debug!(
            items = keys.len(),
            failed = report.failures.len(),
            took_ms = report.took_ms,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Bulk request completed"
        );
        Ok(report)
    }
}

/// NDJSON body upserting every entry's document
pub fn upsert_body(collection: &str, entries: &[&PlanEntry]) -> Result<String> {
    let mut body = String::new();
    for entry in entries {
        let document = entry.document().ok_or_else(|| {
            SyncError::Internal(format!("upsert entry for key {} has no document", entry.key))
        })?;
        let action = json!({
            "index": {
                "_index": collection,
                "_id": entry.key.document_id()
            }
        });
        push_line(&mut body, &action)?;
        push_line(&mut body, document)?;
    }
    Ok(body)
}

/// NDJSON body deleting every key
pub fn delete_body(collection: &str, keys: &[&EntityKey]) -> Result<String> {
    let mut body = String::new();
    for key in keys {
        let action = json!({
            "delete": {
                "_index": collection,
                "_id": key.document_id()
            }
        });
        push_line(&mut body, &action)?;
    }
    Ok(body)
}

fn push_line(body: &mut String, value: &Value) -> Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| SyncError::Internal(format!("Failed to serialize bulk line: {}", e)))?;
    body.push_str(&line);
    body.push('\n');
    Ok(())
}

/// Map a `_bulk` response onto the submitted keys.
///
/// Items come back in request order. A delete of a missing document
/// (`404`, `not_found`, no `error`) counts as success.
pub fn parse_bulk_response(body: &Value, keys: &[&EntityKey]) -> Result<BulkReport> {
    let took_ms = body["took"].as_u64().unwrap_or(0);
    let has_errors = body["errors"].as_bool().unwrap_or(false);
    if !has_errors {
        return Ok(BulkReport::success(took_ms));
    }

    let items = body["items"]
        .as_array()
        .ok_or_else(|| SyncError::store_unavailable("Bulk response reported errors without items"))?;
    if items.len() != keys.len() {
        return Err(SyncError::store_unavailable(format!(
            "Bulk response has {} items for {} requests",
            items.len(),
            keys.len()
        )));
    }

    let mut failures = Vec::new();
    for (item, key) in items.iter().zip(keys) {
        let Some(op) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let Some(error) = op.get("error") else {
            continue;
        };

        let status = op["status"].as_u64().unwrap_or(0);
        let reason = match (error["type"].as_str(), error["reason"].as_str()) {
            (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
            (Some(kind), None) => kind.to_string(),
            (None, Some(reason)) => reason.to_string(),
            (None, None) => error.to_string(),
        };
        let retryable = status == StatusCode::TOO_MANY_REQUESTS.as_u16() as u64 || status >= 500;
        trace!(key = %key, status, retryable, reason = %reason, "Bulk item failed");

        failures.push(EntryFailure {
            key: (*key).clone(),
            reason,
            retryable,
        });
    }

    Ok(BulkReport { failures, took_ms })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Lifecycle for BulkStore {
    async fn start(&self) -> Result<()> {
        let resp = self
            .build_request(reqwest::Method::GET, "/")
            .send()
            .await
            .map_err(|e| SyncError::store_unavailable_with_source("Connection failed", e))?;

        if !resp.status().is_success() {
            return Err(SyncError::store_unavailable(format!(
                "Store ping returned {}",
                resp.status()
            )));
        }

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
impl HealthCheck for BulkStore {
    async fn health_check(&self) -> Result<()> {
        let resp = self
            .build_request(reqwest::Method::GET, "/_cluster/health")
            .send()
            .await
            .map_err(|e| SyncError::store_unavailable_with_source("Health check failed", e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::store_unavailable("Cluster unhealthy"))
        }
    }

    fn component_name(&self) -> &'static str {
        "bulk_store"
    }
}

#[async_trait]
impl DocumentStore for BulkStore {
    async fn bulk_upsert(&self, collection: &str, entries: &[&PlanEntry]) -> Result<BulkReport> {
        if entries.is_empty() {
            return Ok(BulkReport::success(0));
        }
        let body = upsert_body(collection, entries)?;
        let keys: Vec<&EntityKey> = entries.iter().map(|e| &e.key).collect();
        self.send_bulk(body, &keys).await
    }

    async fn bulk_delete(&self, collection: &str, keys: &[&EntityKey]) -> Result<BulkReport> {
        if keys.is_empty() {
            return Ok(BulkReport::success(0));
        }
        let body = delete_body(collection, keys)?;
        self.send_bulk(body, keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_merge_core::MergePlanner;

    #[test]
    fn test_upsert_body() {
        let plan = MergePlanner::default().plan(vec![ChangeRecord::upsert(
            ChangeOperation::Update,
            7i64,
            json!({"id": 7, "name": "G"}),
            1,
        )]);
        let entries: Vec<_> = plan.upserts().collect();
        let body = upsert_body("users", &entries).unwrap();

        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["index"]["_index"], "users");
        assert_eq!(lines[0]["index"]["_id"], "7");
        assert_eq!(lines[1]["name"], "G");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_delete_body() {
        let a = EntityKey::Int(1);
        let b = EntityKey::from("x");
        let body = delete_body("users", &[&a, &b]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"_id\":\"x\""));
    }

    #[test]
    fn test_parse_success_response() {
        let a = EntityKey::Int(1);
        let report = parse_bulk_response(&json!({"took": 5, "errors": false, "items": []}), &[&a])
            .unwrap();
        assert!(report.is_complete_success());
        assert_eq!(report.took_ms, 5);
    }

    #[test]
    fn test_parse_partial_failure() {
        let keys = [EntityKey::Int(1), EntityKey::Int(2), EntityKey::Int(3), EntityKey::Int(4)];
        let refs: Vec<&EntityKey> = keys.iter().collect();
        let body = json!({
            "took": 12,
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201, "result": "created"}},
                {"index": {"_id": "2", "status": 400, "error": {"type": "document_parsing_exception", "reason": "bad field"}}},
                {"index": {"_id": "3", "status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
                {"delete": {"_id": "4", "status": 404, "result": "not_found"}}
            ]
        });

        let report = parse_bulk_response(&body, &refs).unwrap();
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].key, EntityKey::Int(2));
        assert!(!report.failures[0].retryable);
        assert_eq!(report.failures[0].reason, "document_parsing_exception: bad field");
        assert_eq!(report.failures[1].key, EntityKey::Int(3));
        assert!(report.failures[1].retryable);
    }

    #[test]
    fn test_parse_mismatched_items() {
        let a = EntityKey::Int(1);
        let err = parse_bulk_response(&json!({"errors": true, "items": []}), &[&a]).unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_new_requires_hosts() {
        let config = StoreConfig {
            hosts: Vec::new(),
            ..Default::default()
        };
        assert!(BulkStore::new(config).is_err());
    }
}
