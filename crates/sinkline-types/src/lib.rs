//! Shared data model and error taxonomy for the Sinkline ingestion pipeline.
//!
//! This crate has no async runtime dependency so that plugin authors and the
//! state backends can depend on it without pulling in the engine.

pub mod error;
pub mod payload;
pub mod state;
pub mod value;

pub use error::{
    AggregatedFailure, FailureContext, FailureSummary, IngestionError, PluginError, ResolvableBy,
    ValidationError,
};
pub use payload::{BatchKey, IngestionMetadata, PayloadId, Record};
pub use state::{DataSourcePayload, SourceStateDocument, StateMap, StreamName};
pub use value::{CellValue, TemporalFormat};
