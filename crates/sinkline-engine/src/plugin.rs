//! Sink plugin boundary.
//!
//! A plugin is registered under a method name. The same trait serves the
//! primary sink (`ingest_payload`) and chain members (`pre_ingest_process`,
//! `post_ingest_process`); which hooks run depends on where the method is
//! placed by the job configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sinkline_types::{
    BatchKey, FailureContext, IngestionError, IngestionMetadata, PayloadId, PluginError, Record,
};

/// A pluggable sink. Hooks run on worker threads, possibly concurrently,
/// so implementations that wrap a non thread-safe client must guard it.
pub trait IngesterPlugin: Send + Sync {
    /// Deliver one batch. Called once per flushed batch.
    ///
    /// # Errors
    ///
    /// Any error fails the whole batch.
    fn ingest_payload(
        &self,
        payload: &[Record],
        key: &BatchKey,
        metadata: &IngestionMetadata,
    ) -> anyhow::Result<()>;

    /// Rewrite the batch and its metadata before the sink sees them.
    ///
    /// # Errors
    ///
    /// An error aborts the batch; the sink is not called.
    fn pre_ingest_process(
        &self,
        payload: &mut Vec<Record>,
        key: &BatchKey,
        metadata: &mut IngestionMetadata,
    ) -> anyhow::Result<()> {
        let _ = (payload, key, metadata);
        Ok(())
    }

    /// Observe the outcome of a batch. `error` is the pre-process or sink
    /// failure, if any.
    ///
    /// # Errors
    ///
    /// An error fails a batch that otherwise succeeded.
    fn post_ingest_process(
        &self,
        payload: &[Record],
        key: &BatchKey,
        metadata: &mut IngestionMetadata,
        error: Option<&IngestionError>,
    ) -> anyhow::Result<()> {
        let _ = (payload, key, metadata, error);
        Ok(())
    }
}

/// Builds a plugin instance for one method.
pub type PluginFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn IngesterPlugin>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit method name to factory map.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn IngesterPlugin>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(method = %name, "Replacing previously registered ingestion method");
        }
        self
    }

    /// Register a shared instance; every instantiation returns the same plugin.
    pub fn register_instance(
        &mut self,
        name: impl Into<String>,
        plugin: Arc<dyn IngesterPlugin>,
    ) -> &mut Self {
        self.register(name, move || Ok(Arc::clone(&plugin)))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the plugin registered as `name`.
    ///
    /// # Errors
    ///
    /// [`IngestionError::Config`] if nothing is registered under `name`,
    /// [`IngestionError::PluginInit`] if the factory fails.
    pub fn instantiate(&self, name: &str) -> Result<Arc<dyn IngesterPlugin>, IngestionError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            IngestionError::config(format!("ingestion method '{name}' is not registered"))
        })?;
        factory().map_err(|e| IngestionError::PluginInit {
            method: name.to_string(),
            plugin: name.to_string(),
            source: PluginError::new(e),
        })
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("methods", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

struct ChainMember {
    name: String,
    plugin: Arc<dyn IngesterPlugin>,
}

/// The resolved plugins for one method: pre-processors, sink, post-processors.
pub struct IngestionChain {
    method: String,
    sink: Arc<dyn IngesterPlugin>,
    pre: Vec<ChainMember>,
    post: Vec<ChainMember>,
}

impl IngestionChain {
    /// A chain with only a sink.
    #[must_use]
    pub fn new(method: impl Into<String>, sink: Arc<dyn IngesterPlugin>) -> Self {
        Self {
            method: method.into(),
            sink,
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_pre(mut self, name: impl Into<String>, plugin: Arc<dyn IngesterPlugin>) -> Self {
        self.pre.push(ChainMember {
            name: name.into(),
            plugin,
        });
        self
    }

    #[must_use]
    pub fn with_post(mut self, name: impl Into<String>, plugin: Arc<dyn IngesterPlugin>) -> Self {
        self.post.push(ChainMember {
            name: name.into(),
            plugin,
        });
        self
    }

    /// Instantiate `method` and every chain member from `registry`.
    ///
    /// # Errors
    ///
    /// Fails if any name is unregistered or any factory fails.
    pub fn resolve(
        method: &str,
        registry: &PluginRegistry,
        pre: &[String],
        post: &[String],
    ) -> Result<Self, IngestionError> {
        let mut chain = Self::new(method, registry.instantiate(method)?);
        for name in pre {
            chain = chain.with_pre(name.clone(), instantiate_member(registry, method, name)?);
        }
        for name in post {
            chain = chain.with_post(name.clone(), instantiate_member(registry, method, name)?);
        }
        Ok(chain)
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Run one batch through pre-processors, the sink and post-processors.
    ///
    /// Metadata starts from `metadata` and is threaded through every hook.
    /// Post-processors always run, in order, and see the first failure.
    /// Blocks the calling thread for as long as the plugins do.
    ///
    /// # Errors
    ///
    /// The first pre-process or sink failure, else the first post-process
    /// failure.
    pub fn process(
        &self,
        payload_id: &PayloadId,
        key: &BatchKey,
        mut records: Vec<Record>,
        mut metadata: IngestionMetadata,
    ) -> Result<(), IngestionError> {
        let context = || FailureContext {
            payload_id: payload_id.clone(),
            key: key.clone(),
            records: 0,
        };

        let mut outcome = Ok(());
        for member in &self.pre {
            if let Err(e) = member
                .plugin
                .pre_ingest_process(&mut records, key, &mut metadata)
            {
                outcome = Err(IngestionError::PreProcess {
                    plugin: member.name.clone(),
                    context: FailureContext {
                        records: records.len(),
                        ..context()
                    },
                    source: PluginError::new(e),
                });
                break;
            }
        }

        if outcome.is_ok() {
            if records.is_empty() {
                tracing::debug!(
                    method = %self.method,
                    payload_id = %payload_id,
                    "Pre-processing emptied batch, skipping sink"
                );
            } else if let Err(e) = self.sink.ingest_payload(&records, key, &metadata) {
                outcome = Err(IngestionError::Sink {
                    method: self.method.clone(),
                    context: FailureContext {
                        records: records.len(),
                        ..context()
                    },
                    source: PluginError::new(e),
                });
            }
        }

        for member in &self.post {
            let observed = outcome.as_ref().err();
            if let Err(e) = member
                .plugin
                .post_ingest_process(&records, key, &mut metadata, observed)
            {
                let err = IngestionError::PostProcess {
                    plugin: member.name.clone(),
                    context: FailureContext {
                        records: records.len(),
                        ..context()
                    },
                    source: PluginError::new(e),
                };
                if outcome.is_ok() {
                    outcome = Err(err);
                } else {
                    tracing::warn!(method = %self.method, error = %err, "Post-processing also failed");
                }
            }
        }

        outcome
    }
}

fn instantiate_member(
    registry: &PluginRegistry,
    method: &str,
    name: &str,
) -> Result<Arc<dyn IngesterPlugin>, IngestionError> {
    if !registry.contains(name) {
        return Err(IngestionError::config(format!(
            "chain member '{name}' of method '{method}' is not a registered ingestion method"
        )));
    }
    registry.instantiate(name).map_err(|e| match e {
        IngestionError::PluginInit { source, .. } => IngestionError::PluginInit {
            method: method.to_string(),
            plugin: name.to_string(),
            source,
        },
        other => other,
    })
}

impl fmt::Debug for IngestionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionChain")
            .field("method", &self.method)
            .field("pre", &self.pre.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("post", &self.post.iter().map(|m| &m.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
