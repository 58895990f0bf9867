//! Tabular rows to records.

use sinkline_types::{Record, ValidationError};

use crate::utils::pager::Row;

/// Zip each row with `columns` into one record, normalizing every cell.
///
/// `row_offset` is the index of the first row within the whole submission,
/// so errors point at the right row when converting page by page.
///
/// # Errors
///
/// Returns [`ValidationError::ColumnCountMismatch`] on the first row whose
/// width differs from `columns`, [`ValidationError::InvalidArgument`] when
/// no columns are given, and [`ValidationError::NotSerializable`] for cells
/// that cannot be normalized.
pub fn convert_table(
    rows: Vec<Row>,
    columns: &[String],
    row_offset: usize,
) -> Result<Vec<Record>, ValidationError> {
    if columns.is_empty() {
        return Err(ValidationError::InvalidArgument {
            name: "column_names",
            reason: "at least one column name is required".to_string(),
        });
    }

    let mut records = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != columns.len() {
            return Err(ValidationError::column_mismatch(
                columns,
                row_offset + i,
                row.len(),
                &format!("{row:?}"),
            ));
        }
        let mut record = Record::new();
        for (column, cell) in columns.iter().zip(row) {
            record.insert(column.clone(), cell.normalize()?);
        }
        records.push(record);
    }
    Ok(records)
}
