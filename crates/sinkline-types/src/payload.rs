//! Payload, batch key and ingestion metadata types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record submitted for ingestion: field name to value.
pub type Record = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Batch key
// ---------------------------------------------------------------------------

/// The `(destination_table, target, collection_id)` triple every batch is
/// grouped by. A batch never mixes keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    /// Logical table name at the sink.
    pub destination_table: Option<String>,
    /// Sink endpoint identifier.
    pub target: Option<String>,
    /// Correlation id of the logical submission.
    pub collection_id: Option<String>,
}

impl BatchKey {
    #[must_use]
    pub fn new(
        destination_table: Option<String>,
        target: Option<String>,
        collection_id: Option<String>,
    ) -> Self {
        Self {
            destination_table,
            target,
            collection_id,
        }
    }

    /// The `(destination_table, target)` pair used in failure reports.
    #[must_use]
    pub fn destination(&self) -> (Option<String>, Option<String>) {
        (self.destination_table.clone(), self.target.clone())
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={} target={} collection={}",
            self.destination_table.as_deref().unwrap_or("-"),
            self.target.as_deref().unwrap_or("-"),
            self.collection_id.as_deref().unwrap_or("-"),
        )
    }
}

// ---------------------------------------------------------------------------
// Payload id
// ---------------------------------------------------------------------------

/// Opaque identifier of a flushed batch.
///
/// Errors and logs refer to payloads by id only; payload contents may be
/// sensitive and are never rendered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadId(String);

impl PayloadId {
    #[must_use]
    pub fn new(method: &str, sequence: u64) -> Self {
        Self(format!("{method}-{sequence}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Ingestion metadata
// ---------------------------------------------------------------------------

/// Open key/value bag threaded through pre-processing, the sink call and
/// post-processing. The pipeline itself never interprets the keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestionMetadata(BTreeMap<String, Value>);

impl IngestionMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for `key` if present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Move every entry of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: IngestionMetadata) {
        self.0.extend(other.0);
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for IngestionMetadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
