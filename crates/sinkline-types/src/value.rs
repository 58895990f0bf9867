//! Cell values and the type normalizer.
//!
//! Tabular sources produce [`CellValue`]s. Before anything is queued they are
//! canonicalised into plain JSON so sinks never see a type their serializer
//! cannot handle: temporal values become ISO-8601 strings (or epoch millis),
//! decimals become floats, UUIDs become strings and raw bytes become a list
//! of integers.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// How temporal values are rendered by [`CellValue::normalize_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalFormat {
    #[default]
    Iso8601,
    /// Milliseconds since the Unix epoch. Dates use midnight UTC; times of
    /// day are rendered as milliseconds since midnight.
    EpochMillis,
}

/// A single value read from a tabular source.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Arbitrary-precision decimal in its textual form.
    Decimal { value: String, scale: i32 },
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Json(Value),
}

impl CellValue {
    /// Normalize into JSON using ISO-8601 for temporal values.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NotSerializable`] for non-finite floats and
    /// decimals that do not parse as a number.
    pub fn normalize(self) -> Result<Value, ValidationError> {
        self.normalize_with(TemporalFormat::Iso8601)
    }

    /// Normalize into JSON using the given temporal rendering.
    ///
    /// # Errors
    ///
    /// See [`CellValue::normalize`].
    pub fn normalize_with(self, temporal: TemporalFormat) -> Result<Value, ValidationError> {
        let value = match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Int(i) => Value::from(i),
            Self::Float(f) => finite_float(f)?,
            Self::Text(s) => Value::String(s),
            Self::Decimal { value, scale } => {
                let parsed: f64 = value.trim().parse().map_err(|_| {
                    ValidationError::NotSerializable {
                        reason: format!("decimal '{value}' (scale {scale}) is not a number"),
                    }
                })?;
                finite_float(parsed)?
            }
            Self::Timestamp(ts) => match temporal {
                TemporalFormat::Iso8601 => Value::String(ts.to_rfc3339()),
                TemporalFormat::EpochMillis => Value::from(ts.timestamp_millis()),
            },
            Self::Date(date) => match temporal {
                TemporalFormat::Iso8601 => Value::String(date.format("%Y-%m-%d").to_string()),
                TemporalFormat::EpochMillis => {
                    Value::from(date.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
                }
            },
            Self::Time(time) => match temporal {
                TemporalFormat::Iso8601 => Value::String(time.format("%H:%M:%S%.f").to_string()),
                TemporalFormat::EpochMillis => {
                    let since_midnight = time - NaiveTime::MIN;
                    Value::from(since_midnight.num_milliseconds())
                }
            },
            Self::Uuid(id) => Value::String(id.hyphenated().to_string()),
            Self::Bytes(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
            Self::Json(value) => value,
        };
        Ok(value)
    }
}

fn finite_float(f: f64) -> Result<Value, ValidationError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ValidationError::NotSerializable {
            reason: format!("float value {f} is not finite"),
        })
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for CellValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<Uuid> for CellValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Vec<u8>> for CellValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
