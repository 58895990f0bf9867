//! State storage error types.

/// Errors produced by [`DataSourceStateStorage`](crate::DataSourceStateStorage) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure, with the operation that issued it.
    #[error("sqlite error during {operation}: {source}")]
    Sqlite {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("state document for source '{source_name}' is invalid: {source}")]
    Serde {
        source_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state storage lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn sqlite(operation: &'static str, source: rusqlite::Error) -> Self {
        Self::Sqlite { operation, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
