//! End-to-end tests of the send path: router, batching, dispatch and close.
//!
//! Every test uses `MemorySink` so delivered batches can be inspected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sinkline_engine::config::parser;
use sinkline_engine::plugin::IngesterPlugin;
use sinkline_engine::utils::{Row, RowCursor};
use sinkline_engine::{
    IngestRouter, IngestionConfig, JobConfig, MemorySink, PluginRegistry, SendOptions,
};
use sinkline_types::{
    BatchKey, CellValue, IngestionError, IngestionMetadata, Record, ResolvableBy, ValidationError,
};

fn job(ingestion: IngestionConfig) -> JobConfig {
    JobConfig {
        job_name: "it".into(),
        op_id: "1".into(),
        ingestion,
        ..JobConfig::default()
    }
}

fn router_with(names: &[&str], config: JobConfig) -> (IngestRouter, Vec<Arc<MemorySink>>) {
    sinkline_engine::logging::init("warn");
    let sinks: Vec<_> = names.iter().map(|_| Arc::new(MemorySink::new())).collect();
    let mut registry = PluginRegistry::new();
    for (name, sink) in names.iter().zip(&sinks) {
        let plugin: Arc<dyn IngesterPlugin> = sink.clone();
        registry.register_instance(*name, plugin);
    }
    let router = IngestRouter::new(config, registry).expect("router");
    (router, sinks)
}

async fn wait_for_calls(sink: &MemorySink, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.call_count() < expected {
        assert!(Instant::now() < deadline, "sink never reached {expected} calls");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn to_table(table: &str) -> SendOptions {
    SendOptions::new().destination_table(table)
}

// ---------------------------------------------------------------------------
// Delivery shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_object_is_delivered_wrapped_in_a_list() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let payload = json!({"id": 7, "name": "ada"});

    router
        .send_object_for_ingestion(&payload, &to_table("users"))
        .await
        .unwrap();
    router.close_all().await.unwrap();

    let calls = sinks[0].calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload.len(), 1);
    assert_eq!(serde_json::Value::Object(calls[0].payload[0].clone()), payload);
    assert_eq!(calls[0].key.destination_table.as_deref(), Some("users"));
    assert_eq!(calls[0].key.collection_id.as_deref(), Some("it|1"));
}

#[tokio::test]
async fn invalid_payloads_never_reach_the_sink() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let options = to_table("users");

    for bad in [json!(null), json!([1, 2]), json!("text"), json!({})] {
        let err = router
            .send_object_for_ingestion(&bad, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Validation(_)), "{bad}: {err}");
        assert_eq!(err.resolvable_by(), ResolvableBy::User);
    }

    #[derive(serde::Serialize)]
    struct Reading {
        id: u32,
        value: f64,
    }
    let err = router
        .send_object_for_ingestion(&Reading { id: 1, value: f64::NAN }, &options)
        .await
        .unwrap_err();
    assert!(
        matches!(err, IngestionError::Validation(ValidationError::NotSerializable { .. })),
        "got: {err}"
    );

    router.close_all().await.unwrap();
    assert_eq!(sinks[0].call_count(), 0);
}

#[tokio::test]
async fn column_mismatch_names_columns_and_row() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let rows: Vec<Row> = vec![
        vec![CellValue::Int(1), CellValue::from("ada")],
        vec![CellValue::Int(2)],
    ];

    let err = router
        .send_tabular_data_for_ingestion(rows, &["id", "name"], &to_table("users"))
        .await
        .unwrap_err();
    let IngestionError::Validation(ValidationError::ColumnCountMismatch {
        columns, row_index, ..
    }) = &err
    else {
        panic!("expected a column mismatch, got {err}");
    };
    assert_eq!(columns, &vec!["id".to_string(), "name".to_string()]);
    assert_eq!(*row_index, 1);
    assert!(err.to_string().contains("Int(2)"), "got: {err}");

    router.close_all().await.unwrap();
    assert_eq!(sinks[0].call_count(), 0);
}

#[tokio::test]
async fn tabular_rows_become_records() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let rows: Vec<Row> = (0..3)
        .map(|i| vec![CellValue::Int(i), CellValue::from(format!("user-{i}"))])
        .collect();

    router
        .send_tabular_data_for_ingestion(rows, &["id", "name"], &to_table("users"))
        .await
        .unwrap();
    router.close_all().await.unwrap();

    let records = sinks[0].records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2]["name"], json!("user-2"));
}

struct ChunkedCursor {
    remaining: Vec<Row>,
}

impl RowCursor for ChunkedCursor {
    fn fetch_many(&mut self, n: usize) -> anyhow::Result<Vec<Row>> {
        let take = n.min(self.remaining.len());
        Ok(self.remaining.drain(..take).collect())
    }
}

#[tokio::test]
async fn cursor_rows_are_delivered() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let cursor = ChunkedCursor {
        remaining: (0..5).map(|i| vec![CellValue::Int(i)]).collect(),
    };

    router
        .send_cursor_for_ingestion(cursor, &["id"], &to_table("numbers"))
        .await
        .unwrap();
    router.close_all().await.unwrap();
    assert_eq!(sinks[0].records().len(), 5);
}

// ---------------------------------------------------------------------------
// Batching and backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn size_threshold_flushes_without_close() {
    let config = job(IngestionConfig {
        payload_size_bytes_threshold: 40,
        payloads_queue_size: 1_000,
        payload_aggregator_timeout_seconds: 60.0,
        ..IngestionConfig::default()
    });
    let (router, sinks) = router_with(&["memory"], config);
    let options = to_table("events");

    // 28 bytes each serialized: the second send crosses the threshold.
    router
        .send_object_for_ingestion(&json!({"id": 1, "name": "aaaaaaaaaa"}), &options)
        .await
        .unwrap();
    router
        .send_object_for_ingestion(&json!({"id": 2, "name": "bbbbbbbbbb"}), &options)
        .await
        .unwrap();
    wait_for_calls(&sinks[0], 1).await;
    assert_eq!(sinks[0].calls()[0].payload.len(), 2);

    router
        .send_object_for_ingestion(&json!({"id": 3}), &options)
        .await
        .unwrap();
    router.close_all().await.unwrap();
    let calls = sinks[0].calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].payload.len(), 1);
}

#[tokio::test]
async fn count_threshold_splits_batches_in_order() {
    let config = job(IngestionConfig {
        payloads_queue_size: 3,
        payload_aggregator_timeout_seconds: 60.0,
        worker_threads: 1,
        ..IngestionConfig::default()
    });
    let (router, sinks) = router_with(&["memory"], config);
    for id in 0..7 {
        router
            .send_object_for_ingestion(&json!({ "id": id }), &to_table("t"))
            .await
            .unwrap();
    }
    router.close_all().await.unwrap();

    let sizes: Vec<_> = sinks[0].calls().iter().map(|c| c.payload.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    let ids: Vec<_> = sinks[0].records().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, (0..7).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_objects_queue_blocks_the_producer() {
    let config = job(IngestionConfig {
        objects_queue_size: 1,
        payloads_queue_size: 1,
        worker_threads: 1,
        ..IngestionConfig::default()
    });
    let slow = Arc::new(MemorySink::new().with_delay(Duration::from_millis(200)));
    let mut registry = PluginRegistry::new();
    let plugin: Arc<dyn IngesterPlugin> = slow.clone();
    registry.register_instance("memory", plugin);
    let router = IngestRouter::new(config, registry).unwrap();

    let started = Instant::now();
    for id in 0..6 {
        router
            .send_object_for_ingestion(&json!({ "id": id }), &to_table("t"))
            .await
            .unwrap();
    }
    // Only a handful of requests fit in the queues while the first batch
    // is in the sink, so the producer must have waited for it.
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "producer was never blocked: {:?}",
        started.elapsed()
    );

    router.close_all().await.unwrap();
    assert_eq!(slow.records().len(), 6);
}

// ---------------------------------------------------------------------------
// Failure reporting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn waiting_sender_sees_sink_failure_immediately() {
    let config = job(IngestionConfig {
        wait_to_finish_after_every_send: true,
        ..IngestionConfig::default()
    });
    let (router, sinks) = router_with(&["memory"], config);
    sinks[0].fail_with("destination unavailable");

    let err = router
        .send_object_for_ingestion(&json!({"id": 1}), &to_table("users"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestionError::Sink { .. }), "got: {err}");
    assert!(err.to_string().contains("destination unavailable"));
    assert_eq!(err.context().unwrap().records, 1);

    // Already reported to the caller, so close does not raise it again.
    let stats = router.close_all().await.unwrap();
    assert_eq!(stats["memory"].batches_failed, 1);
}

#[tokio::test]
async fn deferred_sink_failure_surfaces_at_close() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    sinks[0].fail_with("destination unavailable");

    router
        .send_object_for_ingestion(&json!({"id": 1}), &to_table("users"))
        .await
        .unwrap();
    router
        .send_object_for_ingestion(&json!({"id": 2}), &to_table("orders"))
        .await
        .unwrap();

    let err = router.close_all().await.unwrap_err();
    let IngestionError::Aggregated(failure) = &err else {
        panic!("expected aggregated failure, got {err}");
    };
    assert_eq!(failure.failed_batches(), 2);
    let message = err.to_string();
    assert!(message.contains("table=users"), "got: {message}");
    assert!(message.contains("table=orders"), "got: {message}");
    assert!(!message.contains("\"id\""), "payload contents leaked: {message}");
}

#[tokio::test]
async fn suppressed_failures_let_close_succeed() {
    let config = job(IngestionConfig {
        raise_exception_on_failure: false,
        log_upload_errors: false,
        ..IngestionConfig::default()
    });
    let (router, sinks) = router_with(&["memory"], config);
    sinks[0].fail_with("boom");
    router
        .send_object_for_ingestion(&json!({"id": 1}), &to_table("users"))
        .await
        .unwrap();

    let stats = router.close_all().await.unwrap();
    assert_eq!(stats["memory"].payloads_failed, 1);
}

#[tokio::test]
async fn sends_after_close_are_rejected() {
    let (router, _) = router_with(&["memory"], job(IngestionConfig::default()));
    router
        .send_object_for_ingestion(&json!({"id": 1}), &SendOptions::new())
        .await
        .unwrap();
    router.close_all().await.unwrap();

    let err = router
        .send_object_for_ingestion(&json!({"id": 2}), &SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestionError::Closed { .. }), "got: {err}");
}

#[tokio::test]
async fn close_rejects_methods_never_started() {
    let (router, sinks) = router_with(&["memory1", "memory2"], job(IngestionConfig::default()));
    router
        .send_object_for_ingestion(&json!({"id": 1}), &SendOptions::new().method("memory1"))
        .await
        .unwrap();
    router.close_all().await.unwrap();

    let err = router
        .send_object_for_ingestion(&json!({"id": 2}), &SendOptions::new().method("memory2"))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, IngestionError::Closed { method } if method == "memory2"),
        "got: {err}"
    );
    assert_eq!(router.active_methods(), vec!["memory1"]);
    assert_eq!(sinks[1].call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unwaited_records_in_a_waited_batch_fail_at_close() {
    let config = job(IngestionConfig {
        payload_aggregator_timeout_seconds: 60.0,
        ..IngestionConfig::default()
    });
    let (router, sinks) = router_with(&["memory"], config);
    sinks[0].fail_with("destination unavailable");
    let router = Arc::new(router);

    router
        .send_object_for_ingestion(&json!({"plain": 1}), &to_table("users"))
        .await
        .unwrap();

    let worker = Arc::clone(&router);
    let waited = tokio::task::spawn_blocking(move || {
        worker.blocking_send_object_and_wait(&json!({"waited": 2}), &to_table("users"))
    })
    .await
    .unwrap();
    let err = waited.unwrap_err();
    assert_eq!(err.context().unwrap().records, 2);

    let err = router.close_all().await.unwrap_err();
    let IngestionError::Aggregated(failure) = &err else {
        panic!("expected aggregated failure, got {err}");
    };
    assert_eq!(failure.failed_batches(), 1);
    assert_eq!(failure.methods[0].failed_payloads, 1);
    assert_eq!(router.stats("memory").unwrap().payloads_failed, 2);
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn methods_never_share_payloads() {
    let (router, sinks) = router_with(&["memory1", "memory2"], job(IngestionConfig::default()));

    let shared = &router;
    let send_to = move |method: &'static str, count: i64| async move {
        let options = SendOptions::new().method(method).destination_table("t");
        for i in 0..count {
            shared
                .send_object_for_ingestion(&json!({ "method": method, "i": i }), &options)
                .await
                .unwrap();
        }
    };
    tokio::join!(send_to("memory1", 50), send_to("memory2", 30));
    router.close_all().await.unwrap();

    let first = sinks[0].records();
    let second = sinks[1].records();
    assert_eq!(first.len(), 50);
    assert_eq!(second.len(), 30);
    assert!(first.iter().all(|r| r["method"] == json!("memory1")));
    assert!(second.iter().all(|r| r["method"] == json!("memory2")));
}

#[tokio::test]
async fn unregistered_chain_member_fails_at_construction() {
    let mut registry = PluginRegistry::new();
    let plugin: Arc<dyn IngesterPlugin> = Arc::new(MemorySink::new());
    registry.register_instance("memory", plugin);
    let config = JobConfig {
        payload_preprocess_sequence: vec!["enrich".into()],
        ..job(IngestionConfig::default())
    };

    let err = IngestRouter::new(config, registry).unwrap_err();
    assert!(matches!(err, IngestionError::Config { .. }));
    assert!(err.to_string().contains("'enrich'"), "got: {err}");
}

/// Adds a field to every record and a metadata entry.
struct Enrich;

impl IngesterPlugin for Enrich {
    fn ingest_payload(&self, _: &[Record], _: &BatchKey, _: &IngestionMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_ingest_process(
        &self,
        payload: &mut Vec<Record>,
        _key: &BatchKey,
        metadata: &mut IngestionMetadata,
    ) -> anyhow::Result<()> {
        for record in payload.iter_mut() {
            record.insert("enriched".into(), json!(true));
        }
        metadata.insert("enriched_by", "enrich");
        Ok(())
    }
}

#[tokio::test]
async fn pre_processors_run_before_the_sink() {
    let sink = Arc::new(MemorySink::new());
    let mut registry = PluginRegistry::new();
    let plugin: Arc<dyn IngesterPlugin> = sink.clone();
    registry.register_instance("memory", plugin);
    registry.register_instance("enrich", Arc::new(Enrich));
    let config = JobConfig {
        method_default: Some("memory".into()),
        payload_preprocess_sequence: vec!["enrich".into()],
        ..job(IngestionConfig::default())
    };
    let router = IngestRouter::new(config, registry).unwrap();

    router
        .send_object_for_ingestion(&json!({"id": 1}), &to_table("users"))
        .await
        .unwrap();
    router.close_all().await.unwrap();

    let calls = sink.calls();
    assert_eq!(calls[0].payload[0]["enriched"], json!(true));
    assert_eq!(calls[0].metadata.get("enriched_by"), Some(&json!("enrich")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_api_works_from_plain_threads() {
    let (router, sinks) = router_with(&["memory"], job(IngestionConfig::default()));
    let router = Arc::new(router);

    let worker = Arc::clone(&router);
    tokio::task::spawn_blocking(move || {
        worker
            .blocking_send_object_and_wait(&json!({"id": 1}), &to_table("users"))
            .unwrap();
        worker
            .blocking_send_object_for_ingestion(&json!({"id": 2}), &to_table("users"))
            .unwrap();
        worker.blocking_close_all().unwrap();
    })
    .await
    .unwrap();

    assert_eq!(sinks[0].records().len(), 2);
}

#[tokio::test]
async fn router_from_yaml_fixture() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/job.yaml");
    let config = parser::parse_job_config(&path).expect("fixture parses");
    assert_eq!(config.ingestion.worker_threads, 2);

    let (router, sinks) = router_with(&["memory"], config);
    assert_eq!(router.collection_id(), "fixture_job|op-42");
    router
        .send_object_for_ingestion(&json!({"id": 1}), &SendOptions::new())
        .await
        .unwrap();
    router.close_all().await.unwrap();
    assert_eq!(
        sinks[0].calls()[0].key.destination_table.as_deref(),
        Some("fixture_events")
    );
}
