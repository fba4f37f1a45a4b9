//! Configuration types for the CDC merge engine
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::planner::OrderingMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Envelope decoding
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Batch merge planning
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Engine behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// Target document store
    #[serde(default)]
    pub store: StoreConfig,

    /// Store apply timeouts and retries
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Checkpoint storage
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Dead letter queue
    #[serde(default)]
    pub dlq: DlqConfig,

    /// Change feed (broker consumer)
    #[serde(default)]
    pub feed: FeedConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Core Configurations
// ============================================================================

/// Envelope decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Primary-key fields of the source table, in key order
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
}

fn default_key_fields() -> Vec<String> {
    vec!["id".to_string()]
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            key_fields: default_key_fields(),
        }
    }
}

/// Merge planner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// How the winning record per key is chosen
    #[serde(default)]
    pub ordering: OrderingMode,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target collection (index/table) name
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Drop records at or below the loaded checkpoint before planning
    #[serde(default = "default_true")]
    pub skip_applied: bool,
}

fn default_collection() -> String {
    "users".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            skip_applied: true,
        }
    }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Target document store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store hosts (round-robin)
    #[serde(default = "default_store_hosts")]
    pub hosts: Vec<String>,

    /// Optional username for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional API key for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// HTTP request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Make bulk writes visible to search before returning
    #[serde(default)]
    pub refresh: bool,
}

fn default_store_hosts() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hosts: default_store_hosts(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            refresh: false,
        }
    }
}

/// Applier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Upper bound for a single bulk call against the store
    #[serde(with = "humantime_serde", default = "default_store_timeout")]
    pub store_timeout: Duration,

    /// Retry policy for failed entries and transport errors
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            store_timeout: default_store_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// ============================================================================
// Checkpoint and DLQ Configuration
// ============================================================================

/// Checkpoint storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Storage type: "file" or "memory"
    #[serde(default = "default_checkpoint_type")]
    pub storage_type: String,

    /// Path for file-based checkpoint
    #[serde(default = "default_checkpoint_path")]
    pub path: String,

    /// Upper bound for checkpoint load/save
    #[serde(with = "humantime_serde", default = "default_checkpoint_timeout")]
    pub timeout: Duration,
}

fn default_checkpoint_type() -> String {
    "file".to_string()
}

fn default_checkpoint_path() -> String {
    "/var/lib/cdc-merge/checkpoint.json".to_string()
}

fn default_checkpoint_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            storage_type: default_checkpoint_type(),
            path: default_checkpoint_path(),
            timeout: default_checkpoint_timeout(),
        }
    }
}

/// Dead letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Enable DLQ
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// DLQ file path (JSON lines)
    #[serde(default = "default_dlq_path")]
    pub path: String,

    /// Maximum entries kept in memory for inspection
    #[serde(default = "default_dlq_max_size")]
    pub max_size: usize,
}

fn default_dlq_path() -> String {
    "/var/lib/cdc-merge/dlq.jsonl".to_string()
}

fn default_dlq_max_size() -> usize {
    100_000
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_dlq_path(),
            max_size: default_dlq_max_size(),
        }
    }
}

// ============================================================================
// Feed Configuration
// ============================================================================

/// Change feed configuration (NATS JetStream)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Connection name (for monitoring)
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Stream carrying the change envelopes
    #[serde(default = "default_stream_name")]
    pub stream: String,

    /// Durable consumer name
    #[serde(default = "default_consumer_name")]
    pub consumer: String,

    /// Subjects to filter on consumption
    #[serde(default)]
    pub filter_subjects: Vec<String>,

    /// Maximum records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a fetch waits for the batch to fill
    #[serde(with = "humantime_serde", default = "default_fetch_wait")]
    pub fetch_wait: Duration,

    /// Maximum pending acknowledgements
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: u64,

    /// Acknowledgement wait time
    #[serde(with = "humantime_serde", default = "default_ack_wait")]
    pub ack_wait: Duration,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connection_name() -> String {
    "cdc-merge-writer".to_string()
}

fn default_stream_name() -> String {
    "CDC_CHANGES".to_string()
}

fn default_consumer_name() -> String {
    "cdc-merge-writer".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_fetch_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_max_ack_pending() -> u64 {
    10000
}

fn default_ack_wait() -> Duration {
    Duration::from_secs(30)
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            connection_name: default_connection_name(),
            stream: default_stream_name(),
            consumer: default_consumer_name(),
            filter_subjects: Vec::new(),
            batch_size: default_batch_size(),
            fetch_wait: default_fetch_wait(),
            max_ack_pending: default_max_ack_pending(),
            ack_wait: default_ack_wait(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsExporterConfig,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: MetricsExporterConfig::default(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExporterConfig {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus listen address
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl SyncConfig {
    /// Load configuration from defaults, an optional file and environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        Self::load_with(path, Self::environment())
    }

    /// `CDC_MERGE__*` variables, e.g. `CDC_MERGE__ENGINE__COLLECTION=users`.
    /// List settings take comma-separated values:
    /// `CDC_MERGE__STORE__HOSTS=http://es1:9200,http://es2:9200`
    pub fn environment() -> config::Environment {
        config::Environment::with_prefix("CDC_MERGE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("store.hosts")
            .with_list_parse_key("decoder.key_fields")
            .with_list_parse_key("feed.filter_subjects")
    }

    fn load_with(
        path: Option<&str>,
        environment: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(environment);

        builder.build()?.try_deserialize()
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SyncError;

        if self.decoder.key_fields.is_empty()
            || self.decoder.key_fields.iter().any(|f| f.trim().is_empty())
        {
            return Err(SyncError::config("decoder.key_fields must name at least one field"));
        }
        if self.engine.collection.trim().is_empty() {
            return Err(SyncError::config("engine.collection must not be empty"));
        }
        if self.store.hosts.is_empty() {
            return Err(SyncError::config("store.hosts must not be empty"));
        }
        for host in &self.store.hosts {
            let url = Url::parse(host)
                .map_err(|e| SyncError::config(format!("invalid store host '{}': {}", host, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::config(format!(
                    "store host '{}' must use http or https",
                    host
                )));
            }
        }
        if self.apply.retry.max_attempts == 0 {
            return Err(SyncError::config("apply.retry.max_attempts must be at least 1"));
        }
        if self.apply.store_timeout.is_zero() || self.checkpoint.timeout.is_zero() {
            return Err(SyncError::config("store and checkpoint timeouts must be non-zero"));
        }
        if self.feed.batch_size == 0 {
            return Err(SyncError::config("feed.batch_size must be at least 1"));
        }
        if !matches!(self.checkpoint.storage_type.as_str(), "file" | "memory") {
            return Err(SyncError::config(format!(
                "unknown checkpoint storage type '{}'",
                self.checkpoint.storage_type
            )));
        }
        Ok(())
    }
}
