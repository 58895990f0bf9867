//! Caller-facing send API.
//!
//! The router resolves which method a send goes to, owns one
//! [`IngesterBase`] per method (started on first use), and fills in the
//! job's default destination, target and collection id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sinkline_types::{
    AggregatedFailure, BatchKey, IngestionError, IngestionMetadata, Record,
};
use tokio::runtime::Handle;

use crate::base::{IngesterBase, IngestionStats};
use crate::config::validator::validate_job_config;
use crate::config::JobConfig;
use crate::plugin::{IngestionChain, PluginRegistry};
use crate::utils::{to_record, Pager, Row, RowCursor, DEFAULT_PAGE_SIZE};

/// Per-call routing options. Unset fields fall back to job defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub destination_table: Option<String>,
    pub method: Option<String>,
    pub target: Option<String>,
    pub collection_id: Option<String>,
    /// Seed for the batch's ingestion metadata.
    pub metadata: Option<IngestionMetadata>,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn destination_table(mut self, table: impl Into<String>) -> Self {
        self.destination_table = Some(table.into());
        self
    }

    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn collection_id(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: IngestionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Routes sends to per-method pipelines.
pub struct IngestRouter {
    config: JobConfig,
    registry: PluginRegistry,
    collection_id: String,
    bases: Mutex<HashMap<String, Arc<IngesterBase>>>,
    /// Set by `close_all` while holding the `bases` lock.
    closed: AtomicBool,
    runtime: Handle,
}

impl IngestRouter {
    /// Build a router on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`IngestionError::Config`] when called outside a runtime, or see
    /// [`with_runtime`](Self::with_runtime).
    pub fn new(config: JobConfig, registry: PluginRegistry) -> Result<Self, IngestionError> {
        let runtime = Handle::try_current().map_err(|_| {
            IngestionError::config("the ingestion router must be created inside a tokio runtime")
        })?;
        Self::with_runtime(config, registry, runtime)
    }

    /// Build a router whose pipelines run on `runtime`.
    ///
    /// Everything that can be checked without sending is checked here: the
    /// job configuration, the default method and every chain member.
    ///
    /// # Errors
    ///
    /// [`IngestionError::Config`] listing what is wrong.
    pub fn with_runtime(
        config: JobConfig,
        registry: PluginRegistry,
        runtime: Handle,
    ) -> Result<Self, IngestionError> {
        validate_job_config(&config).map_err(|e| IngestionError::config(format!("{e:#}")))?;

        let mut errors = Vec::new();
        if registry.is_empty() {
            errors.push("no ingestion methods are registered".to_string());
        }
        if let Some(method) = &config.method_default {
            if !registry.contains(method) {
                errors.push(format!("default method '{method}' is not registered"));
            }
        }
        for (sequence, names) in [
            ("payload_preprocess_sequence", &config.payload_preprocess_sequence),
            ("payload_postprocess_sequence", &config.payload_postprocess_sequence),
        ] {
            for name in names {
                if !registry.contains(name) {
                    errors.push(format!("{sequence} member '{name}' is not registered"));
                }
            }
        }
        if !errors.is_empty() {
            return Err(IngestionError::config(errors.join("; ")));
        }

        let collection_id = config.default_collection_id();
        tracing::info!(
            job = %config.job_name,
            collection_id = %collection_id,
            methods = ?registry.names().collect::<Vec<_>>(),
            "Ingestion router ready"
        );

        Ok(Self {
            config,
            registry,
            collection_id,
            bases: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            runtime,
        })
    }

    /// Collection id used when a send does not supply one.
    #[must_use]
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    #[must_use]
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Methods whose pipeline has been started, sorted.
    #[must_use]
    pub fn active_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_bases().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats of a started method.
    #[must_use]
    pub fn stats(&self, method: &str) -> Option<IngestionStats> {
        self.lock_bases().get(method).map(|base| base.stats())
    }

    /// Pick the method for a send: explicit, else the default, else the
    /// only registered method.
    ///
    /// # Errors
    ///
    /// [`IngestionError::Config`] if the method is unregistered or the
    /// choice is ambiguous.
    pub fn resolve_method(&self, explicit: Option<&str>) -> Result<String, IngestionError> {
        let method = match explicit.or(self.config.method_default.as_deref()) {
            Some(method) => method.to_string(),
            None => {
                let mut names = self.registry.names();
                match (names.next(), names.next()) {
                    (Some(only), None) => only.to_string(),
                    (Some(_), Some(_)) => {
                        return Err(IngestionError::config(
                            "no method given and no method_default configured, \
                             but several methods are registered",
                        ))
                    }
                    (None, _) => {
                        return Err(IngestionError::config("no ingestion methods are registered"))
                    }
                }
            }
        };
        if !self.registry.contains(&method) {
            return Err(IngestionError::config(format!(
                "ingestion method '{method}' is not registered"
            )));
        }
        Ok(method)
    }

    fn base_for(&self, options: &SendOptions) -> Result<Arc<IngesterBase>, IngestionError> {
        let method = self.resolve_method(options.method.as_deref())?;
        let mut bases = self.lock_bases();
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestionError::Closed { method });
        }
        if let Some(base) = bases.get(&method) {
            return Ok(Arc::clone(base));
        }
        let chain = IngestionChain::resolve(
            &method,
            &self.registry,
            &self.config.payload_preprocess_sequence,
            &self.config.payload_postprocess_sequence,
        )?;
        let base = Arc::new(IngesterBase::start(
            chain,
            self.config.ingestion.clone(),
            &self.runtime,
        ));
        bases.insert(method, Arc::clone(&base));
        Ok(base)
    }

    fn batch_key(&self, options: &SendOptions) -> BatchKey {
        BatchKey::new(
            options
                .destination_table
                .clone()
                .or_else(|| self.config.destination_table_default.clone()),
            options
                .target
                .clone()
                .or_else(|| self.config.target_default.clone()),
            Some(
                options
                    .collection_id
                    .clone()
                    .unwrap_or_else(|| self.collection_id.clone()),
            ),
        )
    }

    fn lock_bases(&self) -> MutexGuard<'_, HashMap<String, Arc<IngesterBase>>> {
        self.bases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Async sends
    // -----------------------------------------------------------------------

    /// Send one mapping payload.
    ///
    /// # Errors
    ///
    /// Validation and configuration errors immediately; sink failures only
    /// in synchronous mode.
    pub async fn send_object_for_ingestion<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: &SendOptions,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.send_records(vec![record], options, None).await
    }

    /// Send several mapping payloads as one unit. All are validated first.
    ///
    /// # Errors
    ///
    /// See [`send_object_for_ingestion`](Self::send_object_for_ingestion).
    pub async fn send_objects_for_ingestion<T: Serialize>(
        &self,
        payloads: &[T],
        options: &SendOptions,
    ) -> Result<(), IngestionError> {
        let records = payloads
            .iter()
            .map(to_record)
            .collect::<Result<Vec<_>, _>>()?;
        self.send_records(records, options, None).await
    }

    /// Send rows zipped with `column_names`.
    ///
    /// # Errors
    ///
    /// A validation error naming the columns and the offending row when a
    /// row's width differs from `column_names`.
    pub async fn send_tabular_data_for_ingestion<I, C>(
        &self,
        rows: I,
        column_names: &[C],
        options: &SendOptions,
    ) -> Result<(), IngestionError>
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send,
        C: AsRef<str>,
    {
        let columns = owned_columns(column_names);
        let base = self.base_for(options)?;
        let pager = Pager::from_iter(rows, DEFAULT_PAGE_SIZE);
        base.send_tabular(pager, &columns, self.batch_key(options), options.metadata.clone())
            .await
    }

    /// Send every row of a cursor, fetched one page at a time.
    ///
    /// # Errors
    ///
    /// As [`send_tabular_data_for_ingestion`](Self::send_tabular_data_for_ingestion),
    /// plus [`IngestionError::RowSource`] when fetching fails.
    pub async fn send_cursor_for_ingestion<C: AsRef<str>>(
        &self,
        cursor: impl RowCursor,
        column_names: &[C],
        options: &SendOptions,
    ) -> Result<(), IngestionError> {
        let columns = owned_columns(column_names);
        let base = self.base_for(options)?;
        let pager = Pager::from_cursor(cursor, DEFAULT_PAGE_SIZE);
        base.send_tabular(pager, &columns, self.batch_key(options), options.metadata.clone())
            .await
    }

    async fn send_records(
        &self,
        records: Vec<Record>,
        options: &SendOptions,
        wait: Option<bool>,
    ) -> Result<(), IngestionError> {
        let base = self.base_for(options)?;
        let wait = wait.unwrap_or(self.config.ingestion.wait_to_finish_after_every_send);
        base.send_records(records, self.batch_key(options), options.metadata.clone(), wait)
            .await
    }

    // -----------------------------------------------------------------------
    // Blocking sends
    // -----------------------------------------------------------------------

    /// Blocking form of [`send_object_for_ingestion`](Self::send_object_for_ingestion),
    /// for threads outside the runtime.
    ///
    /// # Errors
    ///
    /// See [`send_object_for_ingestion`](Self::send_object_for_ingestion).
    pub fn blocking_send_object_for_ingestion<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: &SendOptions,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.blocking_send_records(vec![record], options, None)
    }

    /// Send one payload and wait until its batch has been through the sink,
    /// regardless of `wait_to_finish_after_every_send`.
    ///
    /// # Errors
    ///
    /// Validation, configuration and batch failures.
    pub fn blocking_send_object_and_wait<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: &SendOptions,
    ) -> Result<(), IngestionError> {
        let record = to_record(payload)?;
        self.blocking_send_records(vec![record], options, Some(true))
    }

    /// Blocking form of [`send_tabular_data_for_ingestion`](Self::send_tabular_data_for_ingestion).
    ///
    /// # Errors
    ///
    /// See [`send_tabular_data_for_ingestion`](Self::send_tabular_data_for_ingestion).
    pub fn blocking_send_tabular_data_for_ingestion<I, C>(
        &self,
        rows: I,
        column_names: &[C],
        options: &SendOptions,
    ) -> Result<(), IngestionError>
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send,
        C: AsRef<str>,
    {
        let columns = owned_columns(column_names);
        let base = self.base_for(options)?;
        let pager = Pager::from_iter(rows, DEFAULT_PAGE_SIZE);
        base.blocking_send_tabular(pager, &columns, self.batch_key(options), options.metadata.clone())
    }

    fn blocking_send_records(
        &self,
        records: Vec<Record>,
        options: &SendOptions,
        wait: Option<bool>,
    ) -> Result<(), IngestionError> {
        let base = self.base_for(options)?;
        let wait = wait.unwrap_or(self.config.ingestion.wait_to_finish_after_every_send);
        base.blocking_send_records(records, self.batch_key(options), options.metadata.clone(), wait)
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close every started method and report their combined outcome.
    ///
    /// Methods are drained one after another; all are drained even when an
    /// earlier one has failures. Any send made after this call starts fails
    /// with [`IngestionError::Closed`], including sends to methods that were
    /// never started.
    ///
    /// # Errors
    ///
    /// One [`IngestionError::Aggregated`] covering every method with
    /// unreported failures, when `raise_exception_on_failure` is set.
    pub async fn close_all(&self) -> Result<BTreeMap<String, IngestionStats>, IngestionError> {
        let bases: Vec<Arc<IngesterBase>> = {
            let bases = self.lock_bases();
            self.closed.store(true, Ordering::Release);
            let mut bases: Vec<_> = bases.values().cloned().collect();
            bases.sort_by(|a, b| a.method().cmp(b.method()));
            bases
        };

        let mut stats = BTreeMap::new();
        let mut failures = Vec::new();
        for base in bases {
            if let Some(summary) = base.drain().await {
                failures.push(summary);
            }
            stats.insert(base.method().to_string(), base.stats());
        }

        if failures.is_empty() {
            return Ok(stats);
        }
        if self.config.ingestion.raise_exception_on_failure {
            return Err(IngestionError::Aggregated(AggregatedFailure { methods: failures }));
        }
        tracing::warn!(
            methods = failures.len(),
            failed_batches = failures.iter().map(|f| f.failed_batches).sum::<u64>(),
            "Ingestion failures suppressed by configuration"
        );
        Ok(stats)
    }

    /// Blocking form of [`close_all`](Self::close_all).
    ///
    /// # Errors
    ///
    /// See [`close_all`](Self::close_all).
    pub fn blocking_close_all(&self) -> Result<BTreeMap<String, IngestionStats>, IngestionError> {
        self.runtime.block_on(self.close_all())
    }
}

fn owned_columns<C: AsRef<str>>(column_names: &[C]) -> Vec<String> {
    column_names.iter().map(|c| c.as_ref().to_string()).collect()
}

impl std::fmt::Debug for IngestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestRouter")
            .field("job", &self.config.job_name)
            .field("collection_id", &self.collection_id)
            .field("registry", &self.registry)
            .field("active_methods", &self.active_methods())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
