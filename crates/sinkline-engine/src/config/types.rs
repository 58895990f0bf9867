//! Job and ingestion configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_worker_threads() -> usize {
    10
}

fn default_payload_size_bytes_threshold() -> usize {
    500 * 1024
}

fn default_payloads_queue_size() -> usize {
    50
}

fn default_objects_queue_size() -> usize {
    10_000
}

fn default_payload_aggregator_timeout_seconds() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_job_name() -> String {
    "job".to_string()
}

fn default_op_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_max_retries_per_stream() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_max_parallel_streams() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Ingestion thresholds and policy
// ---------------------------------------------------------------------------

/// Per-method thresholds and failure policy. Immutable once a job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Size of the sink dispatch pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Aggregate serialized size that triggers an early flush.
    #[serde(default = "default_payload_size_bytes_threshold")]
    pub payload_size_bytes_threshold: usize,
    /// Payload count that forces a batch. Also bounds the batches channel.
    #[serde(default = "default_payloads_queue_size")]
    pub payloads_queue_size: usize,
    /// Send requests that may wait for the collector before senders block.
    #[serde(default = "default_objects_queue_size")]
    pub objects_queue_size: usize,
    /// Longest a partial batch waits before it is flushed anyway.
    #[serde(default = "default_payload_aggregator_timeout_seconds")]
    pub payload_aggregator_timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub log_upload_errors: bool,
    #[serde(default = "default_true")]
    pub raise_exception_on_failure: bool,
    /// Make every send wait until its batch has been through the sink.
    #[serde(default)]
    pub wait_to_finish_after_every_send: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            payload_size_bytes_threshold: default_payload_size_bytes_threshold(),
            payloads_queue_size: default_payloads_queue_size(),
            objects_queue_size: default_objects_queue_size(),
            payload_aggregator_timeout_seconds: default_payload_aggregator_timeout_seconds(),
            log_upload_errors: true,
            raise_exception_on_failure: true,
            wait_to_finish_after_every_send: false,
        }
    }
}

impl IngestionConfig {
    /// Aggregator timeout as a [`Duration`]. Invalid values fall back to the
    /// default; the validator reports them before any pipeline starts.
    #[must_use]
    pub fn aggregator_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.payload_aggregator_timeout_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_payload_aggregator_timeout_seconds()))
    }
}

// ---------------------------------------------------------------------------
// Data source driver
// ---------------------------------------------------------------------------

/// Settings for the data source driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSettings {
    #[serde(default = "default_max_retries_per_stream")]
    pub max_retries_per_stream: u32,
    /// Base of the exponential retry delay when a stream gives no hint.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_parallel_streams")]
    pub max_parallel_streams: usize,
}

impl Default for DataSourceSettings {
    fn default() -> Self {
        Self {
            max_retries_per_stream: default_max_retries_per_stream(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_parallel_streams: default_max_parallel_streams(),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Everything the engine needs to know about one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,
    /// Operation id of this run. Generated when absent.
    #[serde(default = "default_op_id")]
    pub op_id: String,
    /// Method used when a send names none.
    #[serde(default)]
    pub method_default: Option<String>,
    #[serde(default)]
    pub target_default: Option<String>,
    #[serde(default)]
    pub destination_table_default: Option<String>,
    /// Methods whose pre-ingest hook runs before the sink, in order.
    #[serde(default)]
    pub payload_preprocess_sequence: Vec<String>,
    /// Methods whose post-ingest hook runs after the sink, in order.
    #[serde(default)]
    pub payload_postprocess_sequence: Vec<String>,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub data_source: DataSourceSettings,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            op_id: default_op_id(),
            method_default: None,
            target_default: None,
            destination_table_default: None,
            payload_preprocess_sequence: Vec::new(),
            payload_postprocess_sequence: Vec::new(),
            ingestion: IngestionConfig::default(),
            data_source: DataSourceSettings::default(),
        }
    }
}

impl JobConfig {
    /// Collection id attached to sends that do not supply one.
    #[must_use]
    pub fn default_collection_id(&self) -> String {
        format!("{}|{}", self.job_name, self.op_id)
    }
}
