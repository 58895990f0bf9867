//! Schema-described data source configuration.
//!
//! Each source type declares the fields it accepts as a [`ConfigSchema`].
//! Raw JSON objects are checked against it once, producing a
//! [`DataSourceConfig`] whose sensitive values never appear in `Debug`
//! output or logs.

use std::fmt;

use serde_json::{Map, Value};

use super::error::DataSourceError;

const REDACTED: &str = "***";

/// One field accepted by a data source.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub sensitive: bool,
    pub default: Option<Value>,
}

impl ConfigField {
    #[must_use]
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            sensitive: false,
            default: None,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, description)
        }
    }

    /// Mark the value as a secret.
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Value used when the field is absent. Implies optional.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }
}

/// Declared configuration of one data source type.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSchema {
    pub name: String,
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    /// Check `raw` against the schema and fill in defaults.
    ///
    /// Unknown keys, missing required fields and nulls in required fields
    /// are all reported together.
    ///
    /// # Errors
    ///
    /// [`DataSourceError::InvalidConfig`] listing every problem.
    pub fn validate(&self, raw: Map<String, Value>) -> Result<DataSourceConfig, DataSourceError> {
        let mut errors = Vec::new();
        let mut values = Map::new();

        for key in raw.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                errors.push(format!("unknown field '{key}'"));
            }
        }

        for field in &self.fields {
            match raw.get(&field.name) {
                Some(Value::Null) | None if field.required => {
                    errors.push(format!(
                        "missing required field '{}' ({})",
                        field.name, field.description
                    ));
                }
                Some(value) if !value.is_null() => {
                    values.insert(field.name.clone(), value.clone());
                }
                _ => {
                    if let Some(default) = &field.default {
                        values.insert(field.name.clone(), default.clone());
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(DataSourceError::InvalidConfig {
                source_name: self.name.clone(),
                errors,
            });
        }

        let sensitive = self
            .fields
            .iter()
            .filter(|f| f.sensitive)
            .map(|f| f.name.clone())
            .collect();
        Ok(DataSourceConfig {
            source_name: self.name.clone(),
            values,
            sensitive,
        })
    }
}

/// Validated configuration handed to [`DataSource::connect`](super::DataSource::connect).
#[derive(Clone, PartialEq)]
pub struct DataSourceConfig {
    source_name: String,
    values: Map<String, Value>,
    sensitive: Vec<String>,
}

impl DataSourceConfig {
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// String value of a field the source cannot run without.
    ///
    /// # Errors
    ///
    /// Fails if the field is absent or not a string.
    pub fn require_str(&self, name: &str) -> anyhow::Result<&str> {
        self.get_str(name).ok_or_else(|| {
            anyhow::anyhow!(
                "data source '{}' requires string field '{name}'",
                self.source_name
            )
        })
    }
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if self.sensitive.contains(key) {
                map.entry(key, &REDACTED);
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
