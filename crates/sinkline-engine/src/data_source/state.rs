//! Per-source checkpoint state.

use std::sync::{Arc, Mutex, PoisonError};

use sinkline_state::{DataSourceStateStorage, StateError};
use sinkline_types::{SourceStateDocument, StateMap, StreamName};

/// Checkpoint state of one data source.
///
/// Reads go to storage every time. Updates rewrite the whole document,
/// serialized per source so concurrent streams do not lose each other's
/// checkpoints.
#[derive(Clone)]
pub struct DataSourceState {
    source: String,
    storage: Arc<dyn DataSourceStateStorage>,
    write_lock: Arc<Mutex<()>>,
}

impl DataSourceState {
    #[must_use]
    pub fn new(source: impl Into<String>, storage: Arc<dyn DataSourceStateStorage>) -> Self {
        Self {
            source: source.into(),
            storage,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The full persisted document.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn document(&self) -> Result<SourceStateDocument, StateError> {
        self.storage.read(&self.source)
    }

    /// Checkpoint of `stream`, if one was ever committed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn read_stream(&self, stream: &str) -> Result<Option<StateMap>, StateError> {
        Ok(self.document()?.streams.remove(stream))
    }

    /// Replace the checkpoint of `stream`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn update_stream(&self, stream: &str, state: StateMap) -> Result<(), StateError> {
        self.modify(|doc| {
            doc.streams.insert(StreamName::from(stream), state);
        })
    }

    /// Source-wide state stored under `key`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn read_others(&self, key: &str) -> Result<Option<StateMap>, StateError> {
        Ok(self.document()?.others.remove(key))
    }

    /// Replace the source-wide state under `key`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn update_others(&self, key: &str, state: StateMap) -> Result<(), StateError> {
        self.modify(|doc| {
            doc.others.insert(key.to_string(), state);
        })
    }

    fn modify(&self, apply: impl FnOnce(&mut SourceStateDocument)) -> Result<(), StateError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.storage.read(&self.source)?;
        apply(&mut doc);
        self.storage.write(&self.source, &doc)
    }
}

impl std::fmt::Debug for DataSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceState")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
