//! Lazy, fixed-size paging over row sources.
//!
//! Tabular ingestion never materializes a whole result set: rows are pulled
//! one page at a time from either a database-style cursor or any iterator.

use std::fmt;

use sinkline_types::CellValue;

/// Rows per page when the caller does not choose.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

/// One row of a tabular source, positionally matching the column names.
pub type Row = Vec<CellValue>;

/// A cursor that can hand out rows in chunks, like a DB-API cursor.
pub trait RowCursor: Send {
    /// Fetch up to `n` rows. An empty result means the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if rows cannot be fetched.
    fn fetch_many(&mut self, n: usize) -> anyhow::Result<Vec<Row>>;
}

enum Source<'a> {
    Cursor(Box<dyn RowCursor + 'a>),
    Iter(Box<dyn Iterator<Item = Row> + Send + 'a>),
}

/// Iterator of row pages. Yields `Err` once if the cursor fails, then stops.
pub struct Pager<'a> {
    source: Source<'a>,
    page_size: usize,
    exhausted: bool,
}

impl<'a> Pager<'a> {
    /// Page over a cursor with `fetch_many`.
    #[must_use]
    pub fn from_cursor(cursor: impl RowCursor + 'a, page_size: usize) -> Self {
        Self {
            source: Source::Cursor(Box::new(cursor)),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Page over any iterator of rows.
    #[must_use]
    pub fn from_iter<I>(rows: I, page_size: usize) -> Self
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send + 'a,
    {
        Self {
            source: Source::Iter(Box::new(rows.into_iter())),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Iterator for Pager<'_> {
    type Item = anyhow::Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let page = match &mut self.source {
            Source::Cursor(cursor) => match cursor.fetch_many(self.page_size) {
                Ok(rows) => rows,
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            },
            Source::Iter(rows) => rows.by_ref().take(self.page_size).collect(),
        };
        // A short page means the source has nothing left.
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if page.is_empty() {
            None
        } else {
            Some(Ok(page))
        }
    }
}

impl fmt::Debug for Pager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Cursor(_) => "cursor",
            Source::Iter(_) => "iter",
        };
        f.debug_struct("Pager")
            .field("source", &kind)
            .field("page_size", &self.page_size)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
