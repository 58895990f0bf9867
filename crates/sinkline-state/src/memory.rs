//! In-memory [`DataSourceStateStorage`], for tests and throwaway runs.

use std::collections::HashMap;
use std::sync::Mutex;

use sinkline_types::state::SourceStateDocument;

use crate::backend::DataSourceStateStorage;
use crate::error::{self, StateError};

#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    documents: Mutex<HashMap<String, SourceStateDocument>>,
}

impl InMemoryStateStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every source with persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if a writer panicked.
    pub fn sources(&self) -> error::Result<Vec<String>> {
        let documents = self.documents.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut names: Vec<String> = documents.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl DataSourceStateStorage for InMemoryStateStorage {
    fn read(&self, source: &str) -> error::Result<SourceStateDocument> {
        let documents = self.documents.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(documents.get(source).cloned().unwrap_or_default())
    }

    fn write(&self, source: &str, state: &SourceStateDocument) -> error::Result<()> {
        let mut documents = self.documents.lock().map_err(|_| StateError::LockPoisoned)?;
        documents.insert(source.to_string(), state.clone());
        Ok(())
    }
}
