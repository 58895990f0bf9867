//! Stage 2: run flushed batches through the plugin chain on a bounded pool.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sinkline_types::{FailureContext, FailureSummary, IngestionError, PluginError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::collector::Batch;
use super::IngestionStats;
use crate::plugin::IngestionChain;

#[derive(Default)]
struct FailureLog {
    batches: u64,
    payloads: u64,
    destinations: BTreeSet<(Option<String>, Option<String>)>,
    first_error: Option<String>,
}

/// Outcome counters shared between the dispatcher and its owner.
///
/// Records whose failure was already returned to a waiting sender are
/// counted in the stats but left out of the close-time summary.
#[derive(Default)]
pub(crate) struct OutcomeTracker {
    batches_ok: AtomicU64,
    batches_failed: AtomicU64,
    payloads_ok: AtomicU64,
    payloads_failed: AtomicU64,
    unreported: Mutex<FailureLog>,
}

impl OutcomeTracker {
    fn record_success(&self, records: usize) {
        self.batches_ok.fetch_add(1, Ordering::Relaxed);
        self.payloads_ok.fetch_add(records as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, context: &FailureContext, error: &IngestionError, unwaited: usize) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.payloads_failed
            .fetch_add(context.records as u64, Ordering::Relaxed);
        if unwaited == 0 {
            return;
        }
        let mut log = self
            .unreported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        log.batches += 1;
        log.payloads += unwaited as u64;
        log.destinations.insert(context.key.destination());
        log.first_error.get_or_insert_with(|| error.to_string());
    }

    pub(crate) fn stats(&self) -> IngestionStats {
        IngestionStats {
            batches_ok: self.batches_ok.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            payloads_ok: self.payloads_ok.load(Ordering::Relaxed),
            payloads_failed: self.payloads_failed.load(Ordering::Relaxed),
        }
    }

    /// Summary of failures nobody has seen yet, if there are any.
    pub(crate) fn summary(&self, method: &str) -> Option<FailureSummary> {
        let log = self
            .unreported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if log.batches == 0 {
            return None;
        }
        Some(FailureSummary {
            method: method.to_string(),
            failed_batches: log.batches,
            total_batches: self.stats().total_batches(),
            failed_payloads: log.payloads,
            destinations: log.destinations.clone(),
            first_error: log.first_error.clone(),
        })
    }
}

pub(crate) struct Dispatcher {
    chain: Arc<IngestionChain>,
    workers: Arc<Semaphore>,
    tracker: Arc<OutcomeTracker>,
    log_upload_errors: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        chain: Arc<IngestionChain>,
        worker_threads: usize,
        tracker: Arc<OutcomeTracker>,
        log_upload_errors: bool,
    ) -> Self {
        Self {
            chain,
            workers: Arc::new(Semaphore::new(worker_threads.max(1))),
            tracker,
            log_upload_errors,
        }
    }

    /// Dispatch batches until the collector hangs up, then wait for every
    /// in-flight batch.
    pub(crate) async fn run(self, mut batches: mpsc::Receiver<Batch>) {
        let mut in_flight = JoinSet::new();

        while let Some(batch) = batches.recv().await {
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(method = %self.chain.method(), "Worker pool closed: {e}");
                    Batch::reply_all(
                        batch.replies,
                        &Err(IngestionError::ChannelClosed {
                            method: self.chain.method().to_string(),
                        }),
                    );
                    break;
                }
            };
            let chain = Arc::clone(&self.chain);
            let tracker = Arc::clone(&self.tracker);
            let log_errors = self.log_upload_errors;
            in_flight.spawn(async move {
                let _permit = permit;
                execute(chain, tracker, log_errors, batch).await;
            });

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
    }
}

async fn execute(
    chain: Arc<IngestionChain>,
    tracker: Arc<OutcomeTracker>,
    log_errors: bool,
    batch: Batch,
) {
    let Batch {
        id,
        key,
        records,
        metadata,
        replies,
        unwaited,
    } = batch;
    let context = FailureContext {
        payload_id: id,
        key,
        records: records.len(),
    };

    let task_chain = Arc::clone(&chain);
    let task_id = context.payload_id.clone();
    let task_key = context.key.clone();
    let result = tokio::task::spawn_blocking(move || {
        task_chain.process(&task_id, &task_key, records, metadata)
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(IngestionError::Sink {
            method: chain.method().to_string(),
            context: context.clone(),
            source: PluginError::new(anyhow::anyhow!("plugin task panicked: {join_err}")),
        })
    });

    match &result {
        Ok(()) => {
            tracker.record_success(context.records);
            tracing::debug!(
                method = %chain.method(),
                payload_id = %context.payload_id,
                records = context.records,
                "Batch ingested"
            );
        }
        Err(err) => {
            tracker.record_failure(&context, err, unwaited);
            if log_errors {
                tracing::error!(
                    method = %chain.method(),
                    payload_id = %context.payload_id,
                    key = %context.key,
                    records = context.records,
                    resolvable_by = %err.resolvable_by(),
                    "Batch ingestion failed: {err}"
                );
            } else {
                tracing::debug!(
                    method = %chain.method(),
                    payload_id = %context.payload_id,
                    "Batch ingestion failed"
                );
            }
        }
    }

    Batch::reply_all(replies, &result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkline_types::{BatchKey, PayloadId};

    fn context(table: &str, records: usize) -> FailureContext {
        FailureContext {
            payload_id: PayloadId::new("m", 0),
            key: BatchKey::new(Some(table.into()), Some("db".into()), None),
            records,
        }
    }

    #[test]
    fn tracker_summarizes_unreported_failures() {
        let tracker = OutcomeTracker::default();
        tracker.record_success(10);
        let err = IngestionError::config("x");
        tracker.record_failure(&context("users", 3), &err, 3);
        tracker.record_failure(&context("users", 2), &err, 2);
        tracker.record_failure(&context("orders", 4), &err, 0);

        let stats = tracker.stats();
        assert_eq!(stats.batches_failed, 3);
        assert_eq!(stats.payloads_failed, 9);

        let summary = tracker.summary("m").unwrap();
        assert_eq!(summary.failed_batches, 2);
        assert_eq!(summary.total_batches, 4);
        assert_eq!(summary.failed_payloads, 5);
        assert_eq!(summary.destinations.len(), 1);
    }

    #[test]
    fn partially_waited_batch_keeps_unwaited_share() {
        let tracker = OutcomeTracker::default();
        let err = IngestionError::config("x");
        tracker.record_failure(&context("users", 2), &err, 1);

        assert_eq!(tracker.stats().payloads_failed, 2);
        let summary = tracker.summary("m").unwrap();
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.failed_payloads, 1);
    }

    #[test]
    fn tracker_without_failures_has_no_summary() {
        let tracker = OutcomeTracker::default();
        tracker.record_success(1);
        assert!(tracker.summary("m").is_none());
    }
}
