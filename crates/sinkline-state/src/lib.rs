//! Data source state persistence for the Sinkline engine.
//!
//! Provides the [`DataSourceStateStorage`] trait together with an in-memory
//! implementation for tests and a `SQLite` implementation for durable,
//! restart-safe checkpoints.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use backend::DataSourceStateStorage;
pub use error::StateError;
pub use memory::InMemoryStateStorage;
pub use sqlite::SqliteStateStorage;

/// Common imports for state storage consumers.
pub mod prelude {
    pub use crate::backend::DataSourceStateStorage;
    pub use crate::error::StateError;
    pub use crate::memory::InMemoryStateStorage;
    pub use crate::sqlite::SqliteStateStorage;
    pub use sinkline_types::state::{SourceStateDocument, StateMap, StreamName};
}
