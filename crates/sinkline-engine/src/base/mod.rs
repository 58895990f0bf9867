//! Per-method aggregator and dispatcher.
//!
//! An [`IngesterBase`] owns a two-stage pipeline for one sink method:
//!
//! 1. a collector task draining the bounded objects channel into per-key
//!    batches, flushed on size, count, timeout or a waiting sender;
//! 2. a dispatcher running each batch through the plugin chain on a pool of
//!    `worker_threads` blocking workers.
//!
//! The objects channel is the only backpressure: sends block once
//! `objects_queue_size` requests are waiting for the collector.

mod collector;
mod dispatcher;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sinkline_types::{
    AggregatedFailure, BatchKey, FailureSummary, IngestionError, IngestionMetadata, PluginError,
    Record, ValidationError,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use self::collector::{Collector, ObjectRequest};
use self::dispatcher::{Dispatcher, OutcomeTracker};
use crate::config::IngestionConfig;
use crate::plugin::IngestionChain;
use crate::utils::{convert_table, estimate_size, to_record, Pager};

/// Lifecycle of an [`IngesterBase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseState {
    /// Accepting sends.
    Open,
    /// `close` in progress; remaining batches are being flushed.
    Draining,
    /// Terminal. Sends fail with [`IngestionError::Closed`].
    Closed,
}

impl BaseState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Draining => 1,
            Self::Closed => 2,
        }
    }
}

/// Delivery counters for one method. "Payloads" counts records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub batches_ok: u64,
    pub batches_failed: u64,
    pub payloads_ok: u64,
    pub payloads_failed: u64,
}

impl IngestionStats {
    #[must_use]
    pub fn total_batches(&self) -> u64 {
        self.batches_ok + self.batches_failed
    }
}

type PipelineTasks = (JoinHandle<()>, JoinHandle<()>);
type ReplyReceiver = oneshot::Receiver<Result<(), IngestionError>>;

/// Aggregator/dispatcher for one sink method.
pub struct IngesterBase {
    method: String,
    config: IngestionConfig,
    state: AtomicU8,
    objects: Mutex<Option<mpsc::Sender<ObjectRequest>>>,
    tasks: tokio::sync::Mutex<Option<PipelineTasks>>,
    tracker: Arc<OutcomeTracker>,
    runtime: Handle,
}

impl IngesterBase {
    /// Spawn the collector and dispatcher for `chain` on `runtime`.
    ///
    /// The runtime must have its time driver enabled.
    #[must_use]
    pub fn start(chain: IngestionChain, config: IngestionConfig, runtime: &Handle) -> Self {
        let method = chain.method().to_string();
        let (objects_tx, objects_rx) = mpsc::channel(config.objects_queue_size.max(1));
        let (batches_tx, batches_rx) = mpsc::channel(config.payloads_queue_size.max(1));
        let tracker = Arc::new(OutcomeTracker::default());

        let collector = {
            let method = method.clone();
            let config = config.clone();
            runtime.spawn(async move {
                Collector::new(&method, &config, batches_tx)
                    .run(objects_rx)
                    .await;
            })
        };
        let dispatcher = runtime.spawn(
            Dispatcher::new(
                Arc::new(chain),
                config.worker_threads,
                Arc::clone(&tracker),
                config.log_upload_errors,
            )
            .run(batches_rx),
        );

        tracing::info!(
            method = %method,
            worker_threads = config.worker_threads,
            objects_queue_size = config.objects_queue_size,
            payloads_queue_size = config.payloads_queue_size,
            payload_size_bytes_threshold = config.payload_size_bytes_threshold,
            "Ingestion method started"
        );

        Self {
            method,
            config,
            state: AtomicU8::new(BaseState::Open.as_u8()),
            objects: Mutex::new(Some(objects_tx)),
            tasks: tokio::sync::Mutex::new(Some((collector, dispatcher))),
            tracker,
            runtime: runtime.clone(),
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> BaseState {
        BaseState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn stats(&self) -> IngestionStats {
        self.tracker.stats()
    }

    // -----------------------------------------------------------------------
    // Async send path
    // -----------------------------------------------------------------------

    /// Validate and enqueue one payload.
    ///
    /// Waits for the sink only when `wait_to_finish_after_every_send` is set.
    ///
    /// # Errors
    ///
    /// Validation errors before anything is queued; [`IngestionError::Closed`]
    /// after `close`; the batch's failure in synchronous mode.
    pub async fn send_object<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        key: BatchKey,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.send_records(vec![record], key, None, self.config.wait_to_finish_after_every_send)
            .await
    }

    /// Like [`send_object`](Self::send_object), but always waits for the
    /// batch carrying this payload to finish.
    ///
    /// # Errors
    ///
    /// As `send_object`, plus any pre-process, sink or post-process failure
    /// of the batch.
    pub async fn send_object_and_wait<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        key: BatchKey,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.send_records(vec![record], key, None, true).await
    }

    /// Convert rows page by page and enqueue each page as one unit.
    ///
    /// Every page is validated before it is queued; a bad row stops the
    /// send, but pages before it may already be queued.
    ///
    /// # Errors
    ///
    /// [`ValidationError::ColumnCountMismatch`] for rows of the wrong width,
    /// [`IngestionError::RowSource`] when the cursor fails.
    pub async fn send_tabular(
        &self,
        pager: Pager<'_>,
        columns: &[String],
        key: BatchKey,
        metadata: Option<IngestionMetadata>,
    ) -> Result<(), IngestionError> {
        let wait = self.config.wait_to_finish_after_every_send;
        let mut offset = 0;
        for page in pager {
            let rows = page.map_err(|e| IngestionError::RowSource {
                source: PluginError::new(e),
            })?;
            let count = rows.len();
            let records = convert_table(rows, columns, offset)?;
            self.send_records(records, key.clone(), metadata.clone(), wait)
                .await?;
            offset += count;
        }
        if offset == 0 {
            tracing::debug!(method = %self.method, "Tabular send had no rows");
        }
        Ok(())
    }

    /// Enqueue already-built records as one unit.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyPayload`] if `records` or any record in it is
    /// empty; otherwise as [`send_object`](Self::send_object).
    pub async fn send_records(
        &self,
        records: Vec<Record>,
        key: BatchKey,
        metadata: Option<IngestionMetadata>,
        wait: bool,
    ) -> Result<(), IngestionError> {
        let (request, reply) = self.prepare(records, key, metadata, wait)?;
        let sender = self.sender()?;
        sender
            .send(request)
            .await
            .map_err(|_| self.channel_closed())?;
        drop(sender);
        match reply {
            Some(rx) => rx.await.map_err(|_| self.channel_closed())?,
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Blocking send path
    // -----------------------------------------------------------------------
    //
    // For threads outside the async runtime, such as data source readers.
    // These panic if called from within an async context.

    /// Blocking form of [`send_object`](Self::send_object).
    ///
    /// # Errors
    ///
    /// See [`send_object`](Self::send_object).
    pub fn blocking_send_object<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        key: BatchKey,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.blocking_send_records(vec![record], key, None, self.config.wait_to_finish_after_every_send)
    }

    /// Blocking form of [`send_object_and_wait`](Self::send_object_and_wait).
    ///
    /// # Errors
    ///
    /// See [`send_object_and_wait`](Self::send_object_and_wait).
    pub fn blocking_send_object_and_wait<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        key: BatchKey,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.blocking_send_records(vec![record], key, None, true)
    }

    /// Blocking form of [`send_tabular`](Self::send_tabular).
    ///
    /// # Errors
    ///
    /// See [`send_tabular`](Self::send_tabular).
    pub fn blocking_send_tabular(
        &self,
        pager: Pager<'_>,
        columns: &[String],
        key: BatchKey,
        metadata: Option<IngestionMetadata>,
    ) -> Result<(), IngestionError> {
        let wait = self.config.wait_to_finish_after_every_send;
        let mut offset = 0;
        for page in pager {
            let rows = page.map_err(|e| IngestionError::RowSource {
                source: PluginError::new(e),
            })?;
            let count = rows.len();
            let records = convert_table(rows, columns, offset)?;
            self.blocking_send_records(records, key.clone(), metadata.clone(), wait)?;
            offset += count;
        }
        Ok(())
    }

    /// Blocking form of [`send_records`](Self::send_records).
    ///
    /// # Errors
    ///
    /// See [`send_records`](Self::send_records).
    pub fn blocking_send_records(
        &self,
        records: Vec<Record>,
        key: BatchKey,
        metadata: Option<IngestionMetadata>,
        wait: bool,
    ) -> Result<(), IngestionError> {
        let (request, reply) = self.prepare(records, key, metadata, wait)?;
        let sender = self.sender()?;
        sender
            .blocking_send(request)
            .map_err(|_| self.channel_closed())?;
        drop(sender);
        match reply {
            Some(rx) => rx.blocking_recv().map_err(|_| self.channel_closed())?,
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Stop accepting sends and wait until every queued record has been
    /// delivered or has failed.
    ///
    /// # Errors
    ///
    /// [`IngestionError::Aggregated`] when batches failed without a waiter
    /// seeing the failure and `raise_exception_on_failure` is set.
    pub async fn close(&self) -> Result<IngestionStats, IngestionError> {
        let summary = self.drain().await;
        self.finish(summary)
    }

    /// Blocking form of [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// See [`close`](Self::close).
    pub fn blocking_close(&self) -> Result<IngestionStats, IngestionError> {
        let summary = self.runtime.block_on(self.drain());
        self.finish(summary)
    }

    /// Drain the pipeline and return the unreported failures, if any.
    pub(crate) async fn drain(&self) -> Option<FailureSummary> {
        let _ = self.state.compare_exchange(
            BaseState::Open.as_u8(),
            BaseState::Draining.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Dropping the last sender ends the collector once queued requests
        // are consumed; it then drops the batches sender, ending dispatch.
        drop(self.lock_objects().take());

        let mut tasks = self.tasks.lock().await;
        if let Some((collector, dispatcher)) = tasks.take() {
            if let Err(e) = collector.await {
                tracing::error!(method = %self.method, "Collector task failed: {e}");
            }
            if let Err(e) = dispatcher.await {
                tracing::error!(method = %self.method, "Dispatcher task failed: {e}");
            }
            let stats = self.stats();
            tracing::info!(
                method = %self.method,
                batches_ok = stats.batches_ok,
                batches_failed = stats.batches_failed,
                payloads_ok = stats.payloads_ok,
                payloads_failed = stats.payloads_failed,
                "Ingestion method closed"
            );
        }
        drop(tasks);

        self.state
            .store(BaseState::Closed.as_u8(), Ordering::Release);
        self.tracker.summary(&self.method)
    }

    fn finish(&self, summary: Option<FailureSummary>) -> Result<IngestionStats, IngestionError> {
        match summary {
            Some(summary) if self.config.raise_exception_on_failure => {
                Err(IngestionError::Aggregated(AggregatedFailure {
                    methods: vec![summary],
                }))
            }
            Some(summary) => {
                tracing::warn!(
                    method = %self.method,
                    failed_batches = summary.failed_batches,
                    "Ingestion failures suppressed by configuration"
                );
                Ok(self.stats())
            }
            None => Ok(self.stats()),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn prepare(
        &self,
        records: Vec<Record>,
        key: BatchKey,
        metadata: Option<IngestionMetadata>,
        wait: bool,
    ) -> Result<(ObjectRequest, Option<ReplyReceiver>), IngestionError> {
        if records.is_empty() || records.iter().any(serde_json::Map::is_empty) {
            return Err(ValidationError::EmptyPayload.into());
        }
        let size_bytes = records.iter().map(estimate_size).sum();
        let (reply, rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Ok((
            ObjectRequest {
                key,
                records,
                size_bytes,
                metadata,
                reply,
            },
            rx,
        ))
    }

    fn sender(&self) -> Result<mpsc::Sender<ObjectRequest>, IngestionError> {
        if self.state() != BaseState::Open {
            return Err(self.closed());
        }
        self.lock_objects().clone().ok_or_else(|| self.closed())
    }

    fn lock_objects(&self) -> MutexGuard<'_, Option<mpsc::Sender<ObjectRequest>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(&self) -> IngestionError {
        IngestionError::Closed {
            method: self.method.clone(),
        }
    }

    fn channel_closed(&self) -> IngestionError {
        IngestionError::ChannelClosed {
            method: self.method.clone(),
        }
    }
}

impl Drop for IngesterBase {
    fn drop(&mut self) {
        if self.state() == BaseState::Open {
            tracing::warn!(
                method = %self.method,
                "Ingestion method dropped without close; queued batches finish in the background"
            );
        }
    }
}

impl std::fmt::Debug for IngesterBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngesterBase")
            .field("method", &self.method)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
