//! Name to data source factory mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::config::{ConfigSchema, DataSourceConfig};
use super::error::DataSourceError;
use super::DataSource;

type SourceFactory = Arc<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

struct Entry {
    schema: ConfigSchema,
    factory: SourceFactory,
}

/// Registered data source types, by name.
#[derive(Default)]
pub struct DataSourceRegistry {
    entries: BTreeMap<String, Entry>,
}

impl DataSourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source type. The schema is taken from a freshly built
    /// instance.
    pub fn register<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    {
        let sample = factory();
        let name = sample.name().to_string();
        let schema = sample.schema();
        if self.entries.contains_key(&name) {
            tracing::warn!(source = %name, "Replacing registered data source");
        }
        self.entries.insert(
            name,
            Entry {
                schema,
                factory: Arc::new(factory),
            },
        );
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn schema(&self, name: &str) -> Option<&ConfigSchema> {
        self.entries.get(name).map(|e| &e.schema)
    }

    /// Build a source and validate its raw configuration.
    ///
    /// # Errors
    ///
    /// [`DataSourceError::UnknownSource`] or
    /// [`DataSourceError::InvalidConfig`].
    pub fn create(
        &self,
        name: &str,
        raw: Map<String, Value>,
    ) -> Result<(Box<dyn DataSource>, DataSourceConfig), DataSourceError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| DataSourceError::UnknownSource(name.to_string()))?;
        let config = entry.schema.validate(raw)?;
        Ok(((entry.factory)(), config))
    }
}

impl fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::data_source::{ConfigField, DataSourceState, DataSourceStream};

    struct Dummy;

    impl DataSource for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }

        fn schema(&self) -> ConfigSchema {
            ConfigSchema::new("dummy").field(ConfigField::required("url", "endpoint"))
        }

        fn connect(&mut self, _: &DataSourceConfig, _: &DataSourceState) -> anyhow::Result<()> {
            Ok(())
        }

        fn streams(&mut self) -> anyhow::Result<Vec<Box<dyn DataSourceStream>>> {
            Ok(Vec::new())
        }
    }

    fn registry() -> DataSourceRegistry {
        let mut registry = DataSourceRegistry::new();
        registry.register(|| Box::new(Dummy));
        registry
    }

    #[test]
    fn create_validates_config() {
        let registry = registry();
        assert!(registry.contains("dummy"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["dummy"]);

        let raw = json!({"url": "http://x"}).as_object().cloned().unwrap();
        let (source, config) = registry.create("dummy", raw).unwrap();
        assert_eq!(source.name(), "dummy");
        assert_eq!(config.get_str("url"), Some("http://x"));

        let err = registry.create("dummy", Map::new()).err().expect("expected error");
        assert!(matches!(err, DataSourceError::InvalidConfig { .. }));
    }

    #[test]
    fn unknown_source() {
        let err = registry().create("nope", Map::new()).err().expect("expected error");
        assert_eq!(err.to_string(), "unknown data source 'nope'");
    }
}
