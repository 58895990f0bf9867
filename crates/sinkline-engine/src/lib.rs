//! Ingestion engine for Sinkline.
//!
//! Job code sends records through an [`IngestRouter`], which batches them
//! per destination and delivers each batch to a registered
//! [`IngesterPlugin`] on a bounded worker pool. Pull-based extraction with
//! resumable checkpoints lives in [`data_source`].

pub mod base;
pub mod config;
pub mod data_source;
pub mod logging;
pub mod memory;
pub mod plugin;
pub mod router;
pub mod utils;

// Re-export public API for convenience
pub use base::{BaseState, IngesterBase, IngestionStats};
pub use config::{DataSourceSettings, IngestionConfig, JobConfig};
pub use data_source::{DataSourceError, DataSourceIngester, DataSourcesAggregatedError};
pub use memory::MemorySink;
pub use plugin::{IngesterPlugin, IngestionChain, PluginRegistry};
pub use router::{IngestRouter, SendOptions};
