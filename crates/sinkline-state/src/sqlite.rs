//! `SQLite`-backed implementation of [`DataSourceStateStorage`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Each source owns one
//! row holding its JSON state document.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use sinkline_types::state::SourceStateDocument;

use crate::backend::DataSourceStateStorage;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS data_source_state (
    source TEXT PRIMARY KEY NOT NULL,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStorage::open`] for file-backed persistence
/// or [`SqliteStateStorage::in_memory`] for tests.
pub struct SqliteStateStorage {
    conn: Mutex<Connection>,
}

impl SqliteStateStorage {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StateError::sqlite("open", e))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` storage (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::sqlite("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::sqlite("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// ISO-8601 time of the last write for `source`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] on query failure.
    pub fn updated_at(&self, source: &str) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM data_source_state WHERE source = ?1",
                [source],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::sqlite("read updated_at", e))?;
        Ok(raw.map(|r| Self::sqlite_to_iso8601(&r)))
    }
}

impl DataSourceStateStorage for SqliteStateStorage {
    fn read(&self, source: &str) -> error::Result<SourceStateDocument> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state_json FROM data_source_state WHERE source = ?1",
                [source],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::sqlite("read", e))?;

        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|e| StateError::Serde {
                source_name: source.to_string(),
                source: e,
            }),
            None => Ok(SourceStateDocument::default()),
        }
    }

    fn write(&self, source: &str, state: &SourceStateDocument) -> error::Result<()> {
        let json = serde_json::to_string(state).map_err(|e| StateError::Serde {
            source_name: source.to_string(),
            source: e,
        })?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO data_source_state (source, state_json, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(source) DO UPDATE SET state_json = ?2, updated_at = ?3",
            rusqlite::params![source, json, Self::now_sqlite()],
        )
        .map_err(|e| StateError::sqlite("write", e))?;
        tracing::debug!(source, streams = state.streams.len(), "Persisted data source state");
        Ok(())
    }
}
