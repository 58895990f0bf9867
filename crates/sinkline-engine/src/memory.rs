//! In-memory sink for tests and local dry runs.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sinkline_types::{BatchKey, IngestionMetadata, Record};

use crate::plugin::IngesterPlugin;

/// One `ingest_payload` call as seen by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub payload: Vec<Record>,
    pub key: BatchKey,
    pub metadata: IngestionMetadata,
    pub received_at: DateTime<Utc>,
}

/// Sink that keeps every batch it receives.
///
/// Calls are recorded even when the sink is switched to fail, so tests can
/// count attempts.
#[derive(Debug, Default)]
pub struct MemorySink {
    calls: Mutex<Vec<RecordedCall>>,
    failure: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call, to simulate a slow destination.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every following call with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    /// Stop failing.
    pub fn recover(&self) {
        *lock(&self.failure) = None;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Every record received, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        lock(&self.calls)
            .iter()
            .flat_map(|call| call.payload.iter().cloned())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IngesterPlugin for MemorySink {
    fn ingest_payload(
        &self,
        payload: &[Record],
        key: &BatchKey,
        metadata: &IngestionMetadata,
    ) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        lock(&self.calls).push(RecordedCall {
            payload: payload.to_vec(),
            key: key.clone(),
            metadata: metadata.clone(),
            received_at: Utc::now(),
        });
        if let Some(message) = lock(&self.failure).as_deref() {
            anyhow::bail!("{message}");
        }
        Ok(())
    }
}
