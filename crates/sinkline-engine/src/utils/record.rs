//! Payload shape validation and size estimation.

use std::io;

use serde::Serialize;
use serde_json::Value;
use sinkline_types::{Record, ValidationError};

use super::finite::check_finite;

/// Convert a caller payload into a [`Record`].
///
/// The payload must serialize to a non-empty JSON object. `None`/`null`
/// and empty objects are rejected as empty; arrays and scalars as
/// non-mappings. Non-finite floats anywhere in the payload are rejected
/// instead of turning into `null`.
///
/// # Errors
///
/// Returns a [`ValidationError`] describing why the payload was rejected.
pub fn to_record<T: Serialize + ?Sized>(payload: &T) -> Result<Record, ValidationError> {
    check_finite(payload).map_err(|e| ValidationError::NotSerializable {
        reason: e.to_string(),
    })?;
    let value = serde_json::to_value(payload).map_err(|e| ValidationError::NotSerializable {
        reason: e.to_string(),
    })?;
    match value {
        Value::Null => Err(ValidationError::EmptyPayload),
        Value::Object(map) if map.is_empty() => Err(ValidationError::EmptyPayload),
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::NotAMapping {
            found: ValidationError::json_type_name(&other),
        }),
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized JSON length of `record`, used against the size threshold.
#[must_use]
pub fn estimate_size(record: &Record) -> usize {
    let mut counter = ByteCounter(0);
    // Writing a `Map<String, Value>` into a counter cannot fail.
    let _ = serde_json::to_writer(&mut counter, record);
    counter.0
}
