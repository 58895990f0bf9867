//! Stage 1: assemble per-key batches from individual send requests.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use sinkline_types::{BatchKey, IngestionError, IngestionMetadata, PayloadId, Record};
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::{delay_queue, DelayQueue};

use crate::config::IngestionConfig;
use crate::utils::AtomicCounter;

/// Completion channel of a send that waits for its batch.
pub(crate) type Reply = oneshot::Sender<Result<(), IngestionError>>;

/// One send call as it travels through the objects channel.
pub(crate) struct ObjectRequest {
    pub key: BatchKey,
    pub records: Vec<Record>,
    pub size_bytes: usize,
    pub metadata: Option<IngestionMetadata>,
    pub reply: Option<Reply>,
}

/// Why a batch left the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    /// A sender is waiting on this batch.
    Waiter,
    Size,
    Count,
    Timeout,
    Drain,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Waiter => "waiter",
            Self::Size => "size",
            Self::Count => "count",
            Self::Timeout => "timeout",
            Self::Drain => "drain",
        }
    }
}

/// A flushed batch on its way to the dispatcher.
pub(crate) struct Batch {
    pub id: PayloadId,
    pub key: BatchKey,
    pub records: Vec<Record>,
    pub metadata: IngestionMetadata,
    pub replies: Vec<Reply>,
    /// Records whose sender is not waiting on a reply.
    pub unwaited: usize,
}

impl Batch {
    pub(crate) fn reply_all(replies: Vec<Reply>, result: &Result<(), IngestionError>) {
        for reply in replies {
            // The waiter may have given up; nothing to do then.
            let _ = reply.send(result.clone());
        }
    }
}

struct PendingBatch {
    records: Vec<Record>,
    size_bytes: usize,
    metadata: IngestionMetadata,
    replies: Vec<Reply>,
    unwaited: usize,
    timer_key: delay_queue::Key,
}

pub(crate) struct Collector {
    method: String,
    size_threshold: usize,
    count_threshold: usize,
    timeout: Duration,
    ids: AtomicCounter,
    pending: HashMap<BatchKey, PendingBatch>,
    timers: DelayQueue<BatchKey>,
    batches: mpsc::Sender<Batch>,
}

impl Collector {
    pub(crate) fn new(method: &str, config: &IngestionConfig, batches: mpsc::Sender<Batch>) -> Self {
        Self {
            method: method.to_string(),
            size_threshold: config.payload_size_bytes_threshold,
            count_threshold: config.payloads_queue_size.max(1),
            timeout: config.aggregator_timeout(),
            ids: AtomicCounter::default(),
            pending: HashMap::new(),
            timers: DelayQueue::new(),
            batches,
        }
    }

    /// Run until every sender of `objects` is gone, then flush what is left.
    pub(crate) async fn run(mut self, mut objects: mpsc::Receiver<ObjectRequest>) {
        loop {
            tokio::select! {
                expired = self.timers.next(), if !self.timers.is_empty() => {
                    let Some(entry) = expired else {
                        continue;
                    };
                    let key = entry.into_inner();
                    if let Some(pending) = self.pending.remove(&key) {
                        self.flush(key, pending, FlushTrigger::Timeout).await;
                    }
                }
                request = objects.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    self.append(request).await;
                }
            }
        }

        self.drain().await;
    }

    async fn append(&mut self, request: ObjectRequest) {
        let ObjectRequest {
            key,
            records,
            size_bytes,
            metadata,
            reply,
        } = request;

        let timers = &mut self.timers;
        let timeout = self.timeout;
        let pending = self.pending.entry(key.clone()).or_insert_with(|| PendingBatch {
            records: Vec::new(),
            size_bytes: 0,
            metadata: IngestionMetadata::new(),
            replies: Vec::new(),
            unwaited: 0,
            timer_key: timers.insert(key.clone(), timeout),
        });

        let count = records.len();
        pending.records.extend(records);
        pending.size_bytes += size_bytes;
        if let Some(metadata) = metadata {
            pending.metadata.merge(metadata);
        }
        match reply {
            Some(reply) => pending.replies.push(reply),
            None => pending.unwaited += count,
        }

        // Checked in this order on every append; the timer is independent.
        let trigger = if !pending.replies.is_empty() {
            Some(FlushTrigger::Waiter)
        } else if pending.size_bytes >= self.size_threshold {
            Some(FlushTrigger::Size)
        } else if pending.records.len() >= self.count_threshold {
            Some(FlushTrigger::Count)
        } else {
            None
        };

        if let Some(trigger) = trigger {
            if let Some(pending) = self.pending.remove(&key) {
                self.timers.try_remove(&pending.timer_key);
                self.flush(key, pending, trigger).await;
            }
        }
    }

    async fn drain(&mut self) {
        let pending: Vec<_> = self.pending.drain().collect();
        self.timers.clear();
        for (key, batch) in pending {
            self.flush(key, batch, FlushTrigger::Drain).await;
        }
    }

    async fn flush(&mut self, key: BatchKey, pending: PendingBatch, trigger: FlushTrigger) {
        let id = PayloadId::new(&self.method, self.ids.get_and_increment());
        tracing::debug!(
            method = %self.method,
            payload_id = %id,
            key = %key,
            records = pending.records.len(),
            size_bytes = pending.size_bytes,
            trigger = trigger.as_str(),
            "Flushing batch"
        );

        let batch = Batch {
            id,
            key,
            records: pending.records,
            metadata: pending.metadata,
            replies: pending.replies,
            unwaited: pending.unwaited,
        };
        if let Err(mpsc::error::SendError(batch)) = self.batches.send(batch).await {
            tracing::error!(
                method = %self.method,
                payload_id = %batch.id,
                "Dispatcher stopped, dropping batch"
            );
            Batch::reply_all(
                batch.replies,
                &Err(IngestionError::ChannelClosed {
                    method: self.method.clone(),
                }),
            );
        }
    }
}
