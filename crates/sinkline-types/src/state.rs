//! Data source payload and persisted state document types.
//!
//! Kept in the types crate so both the state backends and the engine can
//! share them without circular dependencies.

use std::borrow::Borrow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::payload::Record;

/// A state fragment: free-form JSON object owned by the data source.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Name of a stream, unique within its data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Borrow<str> for StreamName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for StreamName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One unit yielded by a data source stream.
///
/// `state`, when present, marks this record's position as processed once
/// the record has been handed to the sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourcePayload {
    pub data: Record,
    #[serde(default)]
    pub metadata: StateMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_table: Option<String>,
}

impl DataSourcePayload {
    #[must_use]
    pub fn new(data: Record) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_destination_table(mut self, table: impl Into<String>) -> Self {
        self.destination_table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: StateMap) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// State document
// ---------------------------------------------------------------------------

/// The full persisted state of one data source.
///
/// Stored and rewritten as a single document on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStateDocument {
    /// Per-stream checkpoint state, keyed by stream name.
    #[serde(default)]
    pub streams: BTreeMap<StreamName, StateMap>,
    /// Source-wide state under arbitrary keys.
    #[serde(default)]
    pub others: BTreeMap<String, StateMap>,
}

impl SourceStateDocument {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.others.is_empty()
    }
}
