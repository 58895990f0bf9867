//! Job configuration: types, YAML parsing and semantic validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use types::{DataSourceSettings, IngestionConfig, JobConfig};
