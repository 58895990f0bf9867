//! Pull-based data sources: connect, enumerate streams, read, checkpoint.
//!
//! A [`DataSource`] hands out [`DataSourceStream`]s. Each stream yields
//! [`ReadStep`]s lazily. Ending a stream and asking to be retried are
//! ordinary values, not errors, so genuine failures stay distinguishable.
//! [`DataSourceIngester`] drives sources end to end through an
//! [`IngestRouter`](crate::router::IngestRouter).

pub mod config;
pub mod error;
pub mod ingester;
pub mod registry;
pub mod state;

use std::time::Duration;

use sinkline_types::DataSourcePayload;

pub use config::{ConfigField, ConfigSchema, DataSourceConfig};
pub use error::{DataSourceError, DataSourcesAggregatedError};
pub use ingester::{DataSourceIngester, DataSourceReport, StreamReport};
pub use registry::DataSourceRegistry;
pub use state::DataSourceState;

/// One step of a stream's read loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadStep {
    Payload(DataSourcePayload),
    /// The stream is exhausted for this run.
    Stop,
    /// Transient condition; call `read()` again later.
    Retry { delay_hint: Option<Duration> },
}

/// Lazy iterator returned by [`DataSourceStream::read`].
pub type ReadIter<'a> = Box<dyn Iterator<Item = anyhow::Result<ReadStep>> + Send + 'a>;

/// A named stream of records within a source.
///
/// `read` may be called again after a retry; it should resume from the
/// committed checkpoint in [`DataSourceState`], not from where the previous
/// iterator stopped.
pub trait DataSourceStream: Send {
    /// Unique within the source.
    fn name(&self) -> &str;

    /// Start a read pass.
    ///
    /// # Errors
    ///
    /// Failures to start reading. Failures while reading are yielded by the
    /// iterator instead.
    fn read(&mut self) -> anyhow::Result<ReadIter<'_>>;
}

/// An external system records are extracted from.
pub trait DataSource: Send {
    fn name(&self) -> &str;

    /// Declared configuration, checked before [`connect`](Self::connect).
    fn schema(&self) -> ConfigSchema {
        ConfigSchema::new(self.name())
    }

    /// Open connections. `state` stays valid for the whole run and may be
    /// cloned into streams.
    ///
    /// # Errors
    ///
    /// Connection or authentication failures.
    fn connect(&mut self, config: &DataSourceConfig, state: &DataSourceState)
        -> anyhow::Result<()>;

    /// Streams to read in this run.
    ///
    /// # Errors
    ///
    /// Failures to enumerate streams.
    fn streams(&mut self) -> anyhow::Result<Vec<Box<dyn DataSourceStream>>>;

    /// Release connections. Called even when the run failed.
    ///
    /// # Errors
    ///
    /// Failures while closing.
    fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// A failure seen by the driver while reading a stream.
#[derive(Debug)]
pub struct StreamError<'a> {
    pub stream: &'a str,
    pub error: &'a anyhow::Error,
    /// 1-based read attempt the failure happened in.
    pub attempt: u32,
}

/// What the driver should do about a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorDecision {
    /// Record the stream as failed.
    Fail,
    /// Treat the stream as finished.
    Stop,
    Retry { delay_hint: Option<Duration> },
}

/// Central per-stream failure policy of a driver.
pub trait DataSourceErrorCallback: Send + Sync {
    fn on_error(&self, error: &StreamError<'_>) -> StreamErrorDecision;
}

impl<F> DataSourceErrorCallback for F
where
    F: Fn(&StreamError<'_>) -> StreamErrorDecision + Send + Sync,
{
    fn on_error(&self, error: &StreamError<'_>) -> StreamErrorDecision {
        self(error)
    }
}

/// Policy used when no callback is installed: every error fails the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailOnError;

impl DataSourceErrorCallback for FailOnError {
    fn on_error(&self, _error: &StreamError<'_>) -> StreamErrorDecision {
        StreamErrorDecision::Fail
    }
}
