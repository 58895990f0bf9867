//! Data source error types.

use std::collections::BTreeMap;
use std::fmt;

use sinkline_state::StateError;
use sinkline_types::{IngestionError, PluginError};

/// Errors produced while configuring or driving a data source.
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    /// Raw configuration did not satisfy the source's schema.
    #[error("invalid configuration for data source '{source_name}':\n  - {}", errors.join("\n  - "))]
    InvalidConfig {
        source_name: String,
        errors: Vec<String>,
    },

    #[error("unknown data source '{0}'")]
    UnknownSource(String),

    #[error("data source '{source_name}' failed to connect: {error}")]
    Connect {
        source_name: String,
        error: PluginError,
    },

    #[error("data source '{source_name}' failed to disconnect: {error}")]
    Disconnect {
        source_name: String,
        error: PluginError,
    },

    #[error("data source '{source_name}' failed to list streams: {error}")]
    Streams {
        source_name: String,
        error: PluginError,
    },

    #[error("state storage error: {0}")]
    State(#[from] StateError),

    #[error("stream '{stream}' failed to read: {error}")]
    Read { stream: String, error: PluginError },

    #[error("stream '{stream}' failed to ingest: {error}")]
    Ingestion {
        stream: String,
        error: IngestionError,
    },

    #[error("stream '{stream}' gave up after {attempts} attempts: {reason}")]
    RetriesExhausted {
        stream: String,
        attempts: u32,
        reason: String,
    },

    /// Driver-side failure such as a panicked stream task.
    #[error("internal data source error: {0}")]
    Internal(String),

    #[error(transparent)]
    Aggregated(#[from] DataSourcesAggregatedError),
}

/// Every stream of one run that ended in failure, keyed by stream name.
#[derive(Debug)]
pub struct DataSourcesAggregatedError {
    pub source_name: String,
    pub failures: BTreeMap<String, DataSourceError>,
    /// Streams that finished cleanly in the same run.
    pub completed: Vec<String>,
}

impl DataSourcesAggregatedError {
    /// Names of the failed streams, sorted.
    #[must_use]
    pub fn failed_streams(&self) -> Vec<&str> {
        self.failures.keys().map(String::as_str).collect()
    }
}

impl fmt::Display for DataSourcesAggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data source '{}' had {} failed stream(s) ({} completed)",
            self.source_name,
            self.failures.len(),
            self.completed.len()
        )?;
        for (stream, error) in &self.failures {
            write!(f, "\n  - {stream}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DataSourcesAggregatedError {}
