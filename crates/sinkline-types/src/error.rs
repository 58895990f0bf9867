//! Failure taxonomy for the ingestion pipeline.
//!
//! [`ValidationError`]s are raised synchronously before a payload enters the
//! pipeline. Failures reported by plugins are captured as [`PluginError`]
//! (cheap to clone, so one failure can be delivered to every waiter of a
//! batch) and wrapped into an [`IngestionError`] carrying the batch context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::payload::{BatchKey, PayloadId};

/// Longest rendering of an offending row kept in a validation error.
const MAX_ROW_PREVIEW_CHARS: usize = 256;

// ---------------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------------

/// Who is expected to act on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvableBy {
    /// Job code passed invalid input.
    User,
    /// Job or plugin configuration is wrong.
    Configuration,
    /// A plugin or the system behind it failed.
    External,
    /// The pipeline itself failed.
    Platform,
}

impl fmt::Display for ResolvableBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Configuration => "configuration",
            Self::External => "external",
            Self::Platform => "platform",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Caller input rejected before it reaches any queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload must not be empty")]
    EmptyPayload,

    #[error("payload must be a mapping of field names to values, got {found}")]
    NotAMapping { found: &'static str },

    #[error("payload is not serializable: {reason}")]
    NotSerializable { reason: String },

    #[error(
        "row {row_index} has {actual} values but {expected} column names were provided; \
         columns: {columns:?}; row: {row}"
    )]
    ColumnCountMismatch {
        columns: Vec<String>,
        row_index: usize,
        expected: usize,
        actual: usize,
        row: String,
    },

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },
}

impl ValidationError {
    /// Build a column mismatch error, truncating the row preview.
    #[must_use]
    pub fn column_mismatch(
        columns: &[String],
        row_index: usize,
        actual: usize,
        row_preview: &str,
    ) -> Self {
        let row = if row_preview.chars().count() > MAX_ROW_PREVIEW_CHARS {
            let head: String = row_preview.chars().take(MAX_ROW_PREVIEW_CHARS).collect();
            format!("{head}...")
        } else {
            row_preview.to_string()
        };
        Self::ColumnCountMismatch {
            columns: columns.to_vec(),
            row_index,
            expected: columns.len(),
            actual,
            row,
        }
    }

    /// Name of the JSON type of `value`, for [`ValidationError::NotAMapping`].
    #[must_use]
    pub fn json_type_name(value: &serde_json::Value) -> &'static str {
        match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin failures
// ---------------------------------------------------------------------------

/// Failure raised by a plugin hook.
///
/// Wraps the plugin's `anyhow::Error` behind an `Arc` so it can be cloned
/// into every reply channel waiting on the same batch.
#[derive(Clone)]
pub struct PluginError(Arc<anyhow::Error>);

impl PluginError {
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Borrow the underlying error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for PluginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.chain().nth(1)
    }
}

/// Where a batch-level failure happened. Never includes record contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub payload_id: PayloadId,
    pub key: BatchKey,
    pub records: usize,
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload {} ({} records, {})",
            self.payload_id, self.records, self.key
        )
    }
}

// ---------------------------------------------------------------------------
// Aggregated failures
// ---------------------------------------------------------------------------

/// Outcome summary of one method whose sink reported failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    pub method: String,
    pub failed_batches: u64,
    pub total_batches: u64,
    pub failed_payloads: u64,
    /// Distinct `(destination_table, target)` pairs that failed.
    pub destinations: BTreeSet<(Option<String>, Option<String>)>,
    /// Rendering of the first recorded failure.
    pub first_error: Option<String>,
}

impl fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "method '{}': {} of {} batches failed ({} payloads); destinations: [",
            self.method, self.failed_batches, self.total_batches, self.failed_payloads
        )?;
        for (i, (table, target)) in self.destinations.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "table={} target={}",
                table.as_deref().unwrap_or("-"),
                target.as_deref().unwrap_or("-")
            )?;
        }
        f.write_str("]")?;
        if let Some(first) = &self.first_error {
            write!(f, "; first error: {first}")?;
        }
        Ok(())
    }
}

/// Failures of every method collected at job finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedFailure {
    pub methods: Vec<FailureSummary>,
}

impl AggregatedFailure {
    /// Total failed batches across methods.
    #[must_use]
    pub fn failed_batches(&self) -> u64 {
        self.methods.iter().map(|m| m.failed_batches).sum()
    }
}

impl fmt::Display for AggregatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ingestion failed: {} batch(es) could not be delivered",
            self.failed_batches()
        )?;
        for summary in &self.methods {
            write!(f, "\n  - {summary}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IngestionError
// ---------------------------------------------------------------------------

/// Every failure the send path can surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("ingestion configuration error: {message}")]
    Config { message: String },

    #[error("failed to initialize plugin '{plugin}' for method '{method}': {source}")]
    PluginInit {
        method: String,
        plugin: String,
        source: PluginError,
    },

    #[error("pre-processing by '{plugin}' failed for {context}: {source}")]
    PreProcess {
        plugin: String,
        context: FailureContext,
        source: PluginError,
    },

    #[error("post-processing by '{plugin}' failed for {context}: {source}")]
    PostProcess {
        plugin: String,
        context: FailureContext,
        source: PluginError,
    },

    #[error("sink '{method}' failed to ingest {context}: {source}")]
    Sink {
        method: String,
        context: FailureContext,
        source: PluginError,
    },

    #[error("failed to read rows for ingestion: {source}")]
    RowSource { source: PluginError },

    #[error("{0}")]
    Aggregated(AggregatedFailure),

    #[error("ingestion method '{method}' is closed and no longer accepts payloads")]
    Closed { method: String },

    #[error("ingestion pipeline for method '{method}' stopped unexpectedly")]
    ChannelClosed { method: String },
}

impl IngestionError {
    /// Convenience constructor for configuration errors.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Attribute the failure.
    #[must_use]
    pub fn resolvable_by(&self) -> ResolvableBy {
        match self {
            Self::Validation(_) | Self::Closed { .. } => ResolvableBy::User,
            Self::Config { .. } | Self::PluginInit { .. } => ResolvableBy::Configuration,
            Self::PreProcess { .. }
            | Self::PostProcess { .. }
            | Self::Sink { .. }
            | Self::RowSource { .. }
            | Self::Aggregated(_) => ResolvableBy::External,
            Self::ChannelClosed { .. } => ResolvableBy::Platform,
        }
    }

    /// The batch context, for failures tied to one batch.
    #[must_use]
    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            Self::PreProcess { context, .. }
            | Self::PostProcess { context, .. }
            | Self::Sink { context, .. } => Some(context),
            _ => None,
        }
    }
}
