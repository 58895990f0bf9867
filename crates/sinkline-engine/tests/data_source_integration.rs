//! Data source driver tests: streams, retries, checkpoints and failure
//! aggregation, delivered through a real router into `MemorySink`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sinkline_engine::data_source::{
    ConfigSchema, DataSource, DataSourceConfig, DataSourceError, DataSourceIngester,
    DataSourceState, DataSourceStream, ReadIter, ReadStep, StreamError, StreamErrorDecision,
};
use sinkline_engine::plugin::IngesterPlugin;
use sinkline_engine::{DataSourceSettings, IngestRouter, JobConfig, MemorySink, PluginRegistry};
use sinkline_state::{DataSourceStateStorage, InMemoryStateStorage, SqliteStateStorage};
use sinkline_types::{DataSourcePayload, StateMap};

fn obj(value: Value) -> StateMap {
    value.as_object().cloned().unwrap()
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Yield ids after the committed cursor up to this id, then stop.
    Rows(i64),
    /// Ask to be retried on every read.
    AlwaysRetry,
    /// Fail the first read, then behave like `Rows`.
    FailFirstRead(i64),
}

struct ScriptedStream {
    name: String,
    behavior: Behavior,
    state: DataSourceState,
    reads: Arc<AtomicU32>,
}

impl DataSourceStream for ScriptedStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> anyhow::Result<ReadIter<'_>> {
        let attempt = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let last = match self.behavior {
            Behavior::AlwaysRetry => {
                return Ok(Box::new(std::iter::once(Ok(ReadStep::Retry {
                    delay_hint: Some(Duration::from_millis(1)),
                }))));
            }
            Behavior::FailFirstRead(_) if attempt == 1 => anyhow::bail!("connection reset"),
            Behavior::Rows(last) | Behavior::FailFirstRead(last) => last,
        };

        let cursor = self
            .state
            .read_stream(&self.name)?
            .and_then(|s| s.get("cursor").and_then(Value::as_i64))
            .unwrap_or(0);
        let name = self.name.as_str();
        let rows = ((cursor + 1)..=last).map(move |id| {
            let data = obj(json!({ "id": id, "stream": name }));
            Ok(ReadStep::Payload(
                DataSourcePayload::new(data).with_state(obj(json!({ "cursor": id }))),
            ))
        });
        Ok(Box::new(rows.chain(std::iter::once(Ok(ReadStep::Stop)))))
    }
}

struct TestSource {
    streams: Vec<(String, Behavior, Arc<AtomicU32>)>,
    state: Option<DataSourceState>,
    fail_connect: bool,
    disconnected: Arc<AtomicBool>,
}

impl TestSource {
    fn new(streams: &[(&str, Behavior)]) -> Self {
        Self {
            streams: streams
                .iter()
                .map(|(name, behavior)| (name.to_string(), *behavior, Arc::new(AtomicU32::new(0))))
                .collect(),
            state: None,
            fail_connect: false,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn reads(&self, stream: &str) -> Arc<AtomicU32> {
        self.streams
            .iter()
            .find(|(name, _, _)| name == stream)
            .map(|(_, _, reads)| Arc::clone(reads))
            .unwrap()
    }
}

impl DataSource for TestSource {
    fn name(&self) -> &str {
        "test"
    }

    fn connect(&mut self, _config: &DataSourceConfig, state: &DataSourceState) -> anyhow::Result<()> {
        if self.fail_connect {
            anyhow::bail!("authentication rejected");
        }
        self.state = Some(state.clone());
        Ok(())
    }

    fn streams(&mut self) -> anyhow::Result<Vec<Box<dyn DataSourceStream>>> {
        let state = self
            .state
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        Ok(self
            .streams
            .iter()
            .map(|(name, behavior, reads)| {
                Box::new(ScriptedStream {
                    name: name.clone(),
                    behavior: *behavior,
                    state: state.clone(),
                    reads: Arc::clone(reads),
                }) as Box<dyn DataSourceStream>
            })
            .collect())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn config() -> DataSourceConfig {
    ConfigSchema::new("test").validate(Map::new()).unwrap()
}

fn fast_retries(max_retries_per_stream: u32) -> DataSourceSettings {
    DataSourceSettings {
        max_retries_per_stream,
        retry_backoff_ms: 1,
        max_parallel_streams: 2,
    }
}

fn router() -> (Arc<IngestRouter>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let mut registry = PluginRegistry::new();
    let plugin: Arc<dyn IngesterPlugin> = sink.clone();
    registry.register_instance("memory", plugin);
    let router = IngestRouter::new(JobConfig::default(), registry).unwrap();
    (Arc::new(router), sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrying_stream_fails_alone_while_sibling_delivers() {
    let (router, sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester =
        DataSourceIngester::new(Arc::clone(&router), Arc::clone(&storage)).with_settings(fast_retries(2));

    let source = TestSource::new(&[("users", Behavior::Rows(3)), ("issues", Behavior::AlwaysRetry)]);
    let issue_reads = source.reads("issues");
    let disconnected = Arc::clone(&source.disconnected);

    let err = ingester.run(Box::new(source), config()).await.unwrap_err();
    router.close_all().await.unwrap();

    let DataSourceError::Aggregated(aggregated) = &err else {
        panic!("expected aggregated error, got {err}");
    };
    assert_eq!(aggregated.failed_streams(), vec!["issues"]);
    assert_eq!(aggregated.completed, vec!["users".to_string()]);
    assert!(matches!(
        aggregated.failures["issues"],
        DataSourceError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(issue_reads.load(Ordering::SeqCst), 3);

    let ids: Vec<_> = sink.records().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    assert!(sink
        .calls()
        .iter()
        .all(|c| c.key.destination_table.as_deref() == Some("users")));

    let state = DataSourceState::new("test", storage);
    assert_eq!(state.read_stream("users").unwrap(), Some(obj(json!({"cursor": 3}))));
    assert!(state.read_stream("issues").unwrap().is_none());
    assert!(disconnected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reading_resumes_from_committed_checkpoint() {
    let (router, sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    DataSourceState::new("test", Arc::clone(&storage))
        .update_stream("users", obj(json!({"cursor": 2})))
        .unwrap();

    let ingester = DataSourceIngester::new(Arc::clone(&router), Arc::clone(&storage));
    let report = ingester
        .run(Box::new(TestSource::new(&[("users", Behavior::Rows(5))])), config())
        .await
        .unwrap();
    router.close_all().await.unwrap();

    assert_eq!(report.streams["users"].payloads, 3);
    let ids: Vec<_> = sink.records().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(4), json!(5)]);
}

fn retry_on_reset(e: &StreamError<'_>) -> StreamErrorDecision {
    if e.error.to_string().contains("connection reset") {
        StreamErrorDecision::Retry { delay_hint: None }
    } else {
        StreamErrorDecision::Fail
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_callback_can_retry_a_failed_read() {
    let (router, sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester = DataSourceIngester::new(Arc::clone(&router), storage)
        .with_settings(fast_retries(3))
        .with_error_callback(retry_on_reset);

    let report = ingester
        .run(Box::new(TestSource::new(&[("users", Behavior::FailFirstRead(2))])), config())
        .await
        .unwrap();
    router.close_all().await.unwrap();

    assert_eq!(report.streams["users"].retries, 1);
    assert_eq!(report.total_payloads(), 2);
    assert_eq!(sink.records().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_errors_fail_the_stream_by_default() {
    let (router, _sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester = DataSourceIngester::new(Arc::clone(&router), storage);

    let err = ingester
        .run(Box::new(TestSource::new(&[("users", Behavior::FailFirstRead(2))])), config())
        .await
        .unwrap_err();
    router.close_all().await.unwrap();

    let DataSourceError::Aggregated(aggregated) = &err else {
        panic!("expected aggregated error, got {err}");
    };
    assert!(matches!(aggregated.failures["users"], DataSourceError::Read { .. }));
    assert!(err.to_string().contains("connection reset"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sink_failure_leaves_checkpoint_untouched() {
    let (router, sink) = router();
    sink.fail_with("warehouse down");
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester = DataSourceIngester::new(Arc::clone(&router), Arc::clone(&storage));

    let err = ingester
        .run(Box::new(TestSource::new(&[("users", Behavior::Rows(3))])), config())
        .await
        .unwrap_err();
    // The failure was already returned to the driver.
    router.close_all().await.unwrap();

    let DataSourceError::Aggregated(aggregated) = &err else {
        panic!("expected aggregated error, got {err}");
    };
    assert!(matches!(aggregated.failures["users"], DataSourceError::Ingestion { .. }));
    assert_eq!(sink.call_count(), 1);
    let state = DataSourceState::new("test", storage);
    assert!(state.read_stream("users").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_failure_is_reported_directly() {
    let (router, sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester = DataSourceIngester::new(Arc::clone(&router), storage);

    let mut source = TestSource::new(&[("users", Behavior::Rows(3))]);
    source.fail_connect = true;
    let err = ingester.run(Box::new(source), config()).await.unwrap_err();
    router.close_all().await.unwrap();

    assert!(matches!(err, DataSourceError::Connect { .. }), "got: {err}");
    assert_eq!(sink.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_stream_names_are_rejected() {
    let (router, sink) = router();
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(InMemoryStateStorage::new());
    let ingester = DataSourceIngester::new(Arc::clone(&router), storage);

    let source = TestSource::new(&[("users", Behavior::Rows(1)), ("users", Behavior::Rows(1))]);
    let disconnected = Arc::clone(&source.disconnected);
    let err = ingester.run(Box::new(source), config()).await.unwrap_err();
    router.close_all().await.unwrap();

    assert!(matches!(err, DataSourceError::Streams { .. }), "got: {err}");
    assert_eq!(sink.call_count(), 0);
    assert!(disconnected.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_checkpoints_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let (router, _sink) = router();
        let storage: Arc<dyn DataSourceStateStorage> =
            Arc::new(SqliteStateStorage::open(&path).unwrap());
        let ingester = DataSourceIngester::new(Arc::clone(&router), storage);
        ingester
            .run(Box::new(TestSource::new(&[("users", Behavior::Rows(4))])), config())
            .await
            .unwrap();
        router.close_all().await.unwrap();
    }

    let reopened: Arc<dyn DataSourceStateStorage> = Arc::new(SqliteStateStorage::open(&path).unwrap());
    let state = DataSourceState::new("test", reopened);
    assert_eq!(state.read_stream("users").unwrap(), Some(obj(json!({"cursor": 4}))));
}

#[test]
fn state_roundtrip_through_one_storage() {
    let storage: Arc<dyn DataSourceStateStorage> = Arc::new(SqliteStateStorage::in_memory().unwrap());
    let state = DataSourceState::new("crm", storage);
    let checkpoint = obj(json!({"cursor": "2024-05-01T00:00:00Z", "page": 7, "ids": [1, 2]}));

    state.update_stream("contacts", checkpoint.clone()).unwrap();
    assert_eq!(state.read_stream("contacts").unwrap(), Some(checkpoint));
}
