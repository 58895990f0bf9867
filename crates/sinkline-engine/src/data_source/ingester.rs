//! Driver that pulls data sources through the ingestion router.
//!
//! Streams run in parallel on the blocking pool, bounded by
//! `max_parallel_streams`. Every payload is sent in wait mode, and the
//! stream checkpoint it carries is committed only after its batch has
//! reached the sink. Failed streams do not stop their siblings; they are
//! collected into one [`DataSourcesAggregatedError`].

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use sinkline_state::DataSourceStateStorage;
use sinkline_types::{DataSourcePayload, PluginError, StreamName};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::config::DataSourceConfig;
use super::error::{DataSourceError, DataSourcesAggregatedError};
use super::state::DataSourceState;
use super::{
    DataSource, DataSourceErrorCallback, DataSourceStream, FailOnError, ReadStep, StreamError,
    StreamErrorDecision,
};
use crate::config::DataSourceSettings;
use crate::router::{IngestRouter, SendOptions};

const BACKOFF_MAX_MS: u64 = 60_000;

/// Exponential retry delay for `attempt` (1-based), capped at 60 s.
pub(crate) fn compute_backoff(base_ms: u64, attempt: u32) -> Duration {
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

/// Outcome of one stream in a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamReport {
    /// Payloads delivered, across all attempts.
    pub payloads: u64,
    pub retries: u32,
}

/// Outcome of a run in which every stream finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSourceReport {
    pub source: String,
    pub streams: BTreeMap<StreamName, StreamReport>,
}

impl DataSourceReport {
    #[must_use]
    pub fn total_payloads(&self) -> u64 {
        self.streams.values().map(|s| s.payloads).sum()
    }
}

/// Runs data sources end to end: connect, read every stream, checkpoint,
/// disconnect.
pub struct DataSourceIngester {
    router: Arc<IngestRouter>,
    storage: Arc<dyn DataSourceStateStorage>,
    settings: DataSourceSettings,
    on_error: Arc<dyn DataSourceErrorCallback>,
    options: SendOptions,
}

impl DataSourceIngester {
    /// Driver using the router's job settings and failing streams on any
    /// read error.
    #[must_use]
    pub fn new(router: Arc<IngestRouter>, storage: Arc<dyn DataSourceStateStorage>) -> Self {
        let settings = router.config().data_source.clone();
        Self {
            router,
            storage,
            settings,
            on_error: Arc::new(FailOnError),
            options: SendOptions::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: DataSourceSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_error_callback(mut self, callback: impl DataSourceErrorCallback + 'static) -> Self {
        self.on_error = Arc::new(callback);
        self
    }

    /// Routing options applied to every payload. A payload's own
    /// destination table takes precedence.
    #[must_use]
    pub fn with_send_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    /// Drive `source` to completion.
    ///
    /// # Errors
    ///
    /// Connect and stream listing failures directly;
    /// [`DataSourceError::Aggregated`] when one or more streams failed.
    pub async fn run(
        &self,
        source: Box<dyn DataSource>,
        config: DataSourceConfig,
    ) -> Result<DataSourceReport, DataSourceError> {
        let source_name = source.name().to_string();
        let state = DataSourceState::new(source_name.clone(), Arc::clone(&self.storage));
        tracing::info!(source = %source_name, ?config, "Connecting data source");

        let connect_state = state.clone();
        let (source, connected) = on_source(source, move |s| {
            s.connect(&config, &connect_state)
        })
        .await?;
        if let Err(error) = connected {
            return Err(DataSourceError::Connect {
                source_name,
                error: PluginError::new(error),
            });
        }

        let (source, listed) = on_source(source, |s| s.streams()).await?;
        let outcome = match listed {
            Ok(streams) => match check_unique(&streams) {
                Ok(()) => self.run_streams(&source_name, streams, &state).await,
                Err(error) => Err(DataSourceError::Streams {
                    source_name: source_name.clone(),
                    error: PluginError::new(error),
                }),
            },
            Err(error) => Err(DataSourceError::Streams {
                source_name: source_name.clone(),
                error: PluginError::new(error),
            }),
        };

        let (_, disconnected) = on_source(source, |s| s.disconnect()).await?;
        match (outcome, disconnected) {
            (Ok(report), Ok(())) => {
                tracing::info!(
                    source = %source_name,
                    streams = report.streams.len(),
                    payloads = report.total_payloads(),
                    "Data source finished"
                );
                Ok(report)
            }
            (Ok(_), Err(error)) => Err(DataSourceError::Disconnect {
                source_name,
                error: PluginError::new(error),
            }),
            (Err(err), disconnected) => {
                if let Err(error) = disconnected {
                    tracing::warn!(source = %source_name, "Disconnect after failure also failed: {error:#}");
                }
                Err(err)
            }
        }
    }

    async fn run_streams(
        &self,
        source_name: &str,
        streams: Vec<Box<dyn DataSourceStream>>,
        state: &DataSourceState,
    ) -> Result<DataSourceReport, DataSourceError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_streams.max(1)));
        let mut join_set: JoinSet<(String, Result<StreamReport, DataSourceError>)> = JoinSet::new();

        for stream in streams {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| DataSourceError::Internal(format!("stream semaphore closed: {e}")))?;
            let driver = StreamDriver {
                router: Arc::clone(&self.router),
                state: state.clone(),
                settings: self.settings.clone(),
                on_error: Arc::clone(&self.on_error),
                options: self.options.clone(),
            };
            let name = stream.name().to_string();
            join_set.spawn_blocking(move || {
                let _permit = permit;
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| driver.run(stream)))
                    .unwrap_or_else(|_| {
                        Err(DataSourceError::Internal(format!(
                            "reader of stream '{name}' panicked"
                        )))
                    });
                (name, result)
            });
        }

        let mut report = DataSourceReport {
            source: source_name.to_string(),
            streams: BTreeMap::new(),
        };
        let mut failures = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(stream_report))) => {
                    report.streams.insert(StreamName::new(name), stream_report);
                }
                Ok((name, Err(error))) => {
                    tracing::error!(source = %source_name, stream = %name, "Stream failed: {error}");
                    failures.insert(name, error);
                }
                Err(join_err) => {
                    return Err(DataSourceError::Internal(format!(
                        "stream task failed: {join_err}"
                    )));
                }
            }
        }

        if failures.is_empty() {
            return Ok(report);
        }
        Err(DataSourcesAggregatedError {
            source_name: source_name.to_string(),
            failures,
            completed: report.streams.into_keys().map(StreamName::into_inner).collect(),
        }
        .into())
    }
}

impl std::fmt::Debug for DataSourceIngester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceIngester")
            .field("settings", &self.settings)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Run a source method on the blocking pool and hand the source back.
async fn on_source<T, F>(
    source: Box<dyn DataSource>,
    op: F,
) -> Result<(Box<dyn DataSource>, T), DataSourceError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn DataSource) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut source = source;
        let out = op(source.as_mut());
        (source, out)
    })
    .await
    .map_err(|e| DataSourceError::Internal(format!("data source task failed: {e}")))
}

fn check_unique(streams: &[Box<dyn DataSourceStream>]) -> anyhow::Result<()> {
    let mut seen = BTreeSet::new();
    for stream in streams {
        if !seen.insert(stream.name()) {
            anyhow::bail!("duplicate stream name '{}'", stream.name());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-stream loop
// ---------------------------------------------------------------------------

enum PassOutcome {
    Done,
    Retry {
        delay_hint: Option<Duration>,
        reason: String,
    },
    Failed(DataSourceError),
}

struct StreamDriver {
    router: Arc<IngestRouter>,
    state: DataSourceState,
    settings: DataSourceSettings,
    on_error: Arc<dyn DataSourceErrorCallback>,
    options: SendOptions,
}

impl StreamDriver {
    fn run(&self, mut stream: Box<dyn DataSourceStream>) -> Result<StreamReport, DataSourceError> {
        let name = stream.name().to_string();
        let mut report = StreamReport::default();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let (delay_hint, reason) = match self.read_pass(&name, stream.as_mut(), &mut report, attempt) {
                PassOutcome::Done => {
                    tracing::debug!(
                        stream = %name,
                        payloads = report.payloads,
                        retries = report.retries,
                        "Stream finished"
                    );
                    return Ok(report);
                }
                PassOutcome::Failed(error) => return Err(error),
                PassOutcome::Retry { delay_hint, reason } => (delay_hint, reason),
            };

            if attempt > self.settings.max_retries_per_stream {
                return Err(DataSourceError::RetriesExhausted {
                    stream: name,
                    attempts: attempt,
                    reason,
                });
            }
            report.retries += 1;
            let delay = delay_hint
                .unwrap_or_else(|| compute_backoff(self.settings.retry_backoff_ms, attempt));
            tracing::warn!(
                stream = %name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying stream: {reason}"
            );
            std::thread::sleep(delay);
        }
    }

    fn read_pass(
        &self,
        name: &str,
        stream: &mut dyn DataSourceStream,
        report: &mut StreamReport,
        attempt: u32,
    ) -> PassOutcome {
        let steps = match stream.read() {
            Ok(steps) => steps,
            Err(error) => return self.on_read_error(name, error, attempt),
        };
        for step in steps {
            match step {
                Ok(ReadStep::Payload(payload)) => {
                    if let Err(error) = self.deliver(name, payload) {
                        return PassOutcome::Failed(error);
                    }
                    report.payloads += 1;
                }
                Ok(ReadStep::Stop) => return PassOutcome::Done,
                Ok(ReadStep::Retry { delay_hint }) => {
                    return PassOutcome::Retry {
                        delay_hint,
                        reason: "stream asked to be retried".to_string(),
                    }
                }
                Err(error) => return self.on_read_error(name, error, attempt),
            }
        }
        PassOutcome::Done
    }

    fn on_read_error(&self, name: &str, error: anyhow::Error, attempt: u32) -> PassOutcome {
        let decision = self.on_error.on_error(&StreamError {
            stream: name,
            error: &error,
            attempt,
        });
        match decision {
            StreamErrorDecision::Fail => PassOutcome::Failed(DataSourceError::Read {
                stream: name.to_string(),
                error: PluginError::new(error),
            }),
            StreamErrorDecision::Stop => {
                tracing::warn!(stream = %name, "Stopping stream after error: {error:#}");
                PassOutcome::Done
            }
            StreamErrorDecision::Retry { delay_hint } => PassOutcome::Retry {
                delay_hint,
                reason: format!("{error:#}"),
            },
        }
    }

    /// Send one payload and wait for its batch, then commit its checkpoint.
    fn deliver(&self, name: &str, payload: DataSourcePayload) -> Result<(), DataSourceError> {
        let DataSourcePayload {
            data,
            metadata,
            state,
            destination_table,
        } = payload;

        let mut options = self.options.clone();
        if destination_table.is_some() {
            options.destination_table = destination_table;
        } else if options.destination_table.is_none()
            && self.router.config().destination_table_default.is_none()
        {
            options.destination_table = Some(name.to_string());
        }
        if !metadata.is_empty() {
            let mut merged = options.metadata.take().unwrap_or_default();
            merged.merge(metadata.into_iter().collect());
            options.metadata = Some(merged);
        }

        self.router
            .blocking_send_object_and_wait(&data, &options)
            .map_err(|error| DataSourceError::Ingestion {
                stream: name.to_string(),
                error,
            })?;

        if let Some(state) = state {
            self.state.update_stream(name, state)?;
        }
        Ok(())
    }
}
