//! State storage trait definition.
//!
//! [`DataSourceStateStorage`] is the persistence boundary for data source
//! checkpoints. Model types live in [`sinkline_types::state`].

use sinkline_types::state::SourceStateDocument;

use crate::error;

/// Storage contract for data source state.
///
/// The whole per-source document is read and rewritten as a unit; callers
/// perform read-modify-write, never field-level patches.
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn DataSourceStateStorage>`.
pub trait DataSourceStateStorage: Send + Sync {
    /// Read the state document of `source`.
    ///
    /// Returns an empty document when nothing has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn read(&self, source: &str) -> error::Result<SourceStateDocument>;

    /// Replace the state document of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn write(&self, source: &str, state: &SourceStateDocument) -> error::Result<()>;
}
