//! Payload utilities shared by the send path.

pub mod counter;
mod finite;
pub mod pager;
pub mod record;
pub mod tabular;

pub use counter::AtomicCounter;
pub use pager::{Pager, Row, RowCursor, DEFAULT_PAGE_SIZE};
pub use record::{estimate_size, to_record};
pub use tabular::convert_table;
