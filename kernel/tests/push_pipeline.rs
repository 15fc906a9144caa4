use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use tidewater_kernel::activation::{ActiveVersion, ServingView};
use tidewater_kernel::compression::{CompressionStrategy, Compressor};
use tidewater_kernel::compute::{
    ComputeConfig, ComputeEngine, ComputeFieldError, ComputeRequest, ComputeValue, KeyResult,
};
use tidewater_kernel::config::PushJobConfig;
use tidewater_kernel::log::{InMemoryLog, LogTransport, StartOfPush};
use tidewater_kernel::meta::{topic_name, ReplicaId};
use tidewater_kernel::replica::ServingReplica;
use tidewater_kernel::schema::codec::{encode_key, encode_record};
use tidewater_kernel::schema::{
    AvroStyleCompatibility, FieldType, PrimitiveType, Record, RecordSchema, SchemaRegistry, Value,
};
use tidewater_kernel::simulate::{PushSimulation, SimulationSettings};
use tidewater_kernel::source::SCHEMA_FILE;
use tidewater_kernel::status::{
    ExecutionStatus, ProgressReport, ProgressReporter, PushMonitor, StatusPolicy,
};
use tidewater_kernel::writer::{IngestionWriter, PutOutcome, WriterConfig};

const STORE: &str = "member_features";

const WITH_EMBEDDING: &str = r#"{
  "namespace": "example.compute",
  "type": "record",
  "name": "MemberFeature",
  "fields": [
    { "name": "id", "type": "string" },
    { "name": "name", "type": "string" },
    { "default": [], "doc": "The member companies embedding",
      "name": "companiesEmbedding", "type": { "type": "array", "items": "float" } },
    { "name": "member_feature", "type": { "type": "array", "items": "float" } }
  ]
}"#;

const WITHOUT_EMBEDDING: &str = r#"{
  "namespace": "example.compute",
  "type": "record",
  "name": "MemberFeature",
  "fields": [
    { "name": "id", "type": "string" },
    { "name": "name", "type": "string" },
    { "name": "member_feature", "type": { "type": "array", "items": "float" } }
  ]
}"#;

fn string_key(key: &str) -> Vec<u8> {
    encode_key(
        &FieldType::Primitive(PrimitiveType::String),
        &Value::String(key.into()),
    )
    .unwrap()
}

fn floats(values: &[f32]) -> Value {
    Value::Array(values.iter().copied().map(Value::Float).collect())
}

#[test]
fn compute_isolates_missing_fields_per_record() {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas
        .register_store(STORE, FieldType::Primitive(PrimitiveType::String))
        .unwrap();
    let with = RecordSchema::parse(WITH_EMBEDDING).unwrap();
    let without = RecordSchema::parse(WITHOUT_EMBEDDING).unwrap();
    let with_id = schemas
        .add_value_schema(STORE, with.clone(), &AvroStyleCompatibility)
        .unwrap();
    let without_id = schemas
        .add_value_schema(STORE, without.clone(), &AvroStyleCompatibility)
        .unwrap();

    let log = Arc::new(InMemoryLog::new());
    let topic = topic_name(STORE, 1);
    log.create_topic(&topic, 2).unwrap();
    let reports = Arc::new(Mutex::new(Vec::<ProgressReport>::new()));
    let replica = ServingReplica::new(ReplicaId::new("r0"), "dc-0", log.clone(), reports.clone());
    let hosted = replica.subscribe(STORE, 1).unwrap();

    let mut writer = IngestionWriter::new(log.clone(), &topic, WriterConfig::default()).unwrap();
    writer.accept_value_schema(with_id);
    writer.accept_value_schema(without_id);
    writer
        .broadcast_start_of_push(StartOfPush {
            compression: CompressionStrategy::Zstd,
            ..Default::default()
        })
        .unwrap();

    let first = Record::new()
        .with("id", Value::String("1".into()))
        .with("name", Value::String("first".into()))
        .with("member_feature", floats(&[1.0, 2.0, 3.0]));
    let second = Record::new()
        .with("id", Value::String("2".into()))
        .with("name", Value::String("second".into()))
        .with("companiesEmbedding", floats(&[0.1, 0.2, 0.3]))
        .with("member_feature", floats(&[3.0, 2.0, 1.0]));
    writer
        .put(&string_key("1"), &encode_record(&without, &first).unwrap(), without_id)
        .unwrap();
    writer
        .put(&string_key("2"), &encode_record(&with, &second).unwrap(), with_id)
        .unwrap();
    writer.broadcast_end_of_push().unwrap();

    replica.poll();
    assert!(hosted.is_complete());

    let view = ServingView::pinned(ActiveVersion {
        store: STORE.into(),
        version: 1,
        compressor: Compressor::new(CompressionStrategy::Zstd, None),
        reader: hosted,
    });
    let engine = ComputeEngine::new(STORE, view, schemas, ComputeConfig::default());

    let param = vec![0.1, 0.2, 0.3];
    let request = ComputeRequest::new()
        .cosine_similarity("companiesEmbedding", param.clone(), "companiesEmbedding_score")
        .cosine_similarity("member_feature", param, "member_feature_score");
    let response = engine
        .compute(&[string_key("1"), string_key("2")], &request)
        .unwrap();

    let Some(KeyResult::Computed(one)) = response.get(&string_key("1")) else {
        panic!("key 1 was not computed");
    };
    assert_eq!(one.errors.len(), 1);
    assert!(matches!(
        &one.errors["companiesEmbedding_score"],
        ComputeFieldError::MissingField { field, schema_id }
            if field == "companiesEmbedding" && *schema_id == without_id
    ));
    assert!(!one.outputs.contains_key("companiesEmbedding_score"));
    assert!(one.outputs.contains_key("member_feature_score"));

    let Some(KeyResult::Computed(two)) = response.get(&string_key("2")) else {
        panic!("key 2 was not computed");
    };
    assert!(two.errors.is_empty());
    let score = two.outputs["companiesEmbedding_score"].as_float().unwrap();
    assert!((score - 1.0).abs() < 1e-5);
}

const GENERATION_SCHEMA_V1: &str = r#"{
  "key_schema": "string",
  "value_schema": {
    "name": "Generation", "type": "record",
    "fields": [
      { "name": "generation", "type": "int" },
      { "name": "payload", "type": "string" }
    ]
  }
}"#;

const GENERATION_SCHEMA_V2: &str = r#"{
  "key_schema": "string",
  "value_schema": {
    "name": "Generation", "type": "record",
    "fields": [
      { "name": "generation", "type": "int" },
      { "name": "payload", "type": "string" },
      { "name": "tags", "type": { "type": "array", "items": "string" }, "default": [] }
    ]
  }
}"#;

fn generation_source(schema: &str, generation: i32, rows: usize, payload_len: usize) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(SCHEMA_FILE), schema).unwrap();
    let lines: String = (0..rows)
        .map(|i| {
            serde_json::json!({
                "key": format!("k{i}"),
                "value": { "generation": generation, "payload": "x".repeat(payload_len) }
            })
            .to_string()
                + "\n"
        })
        .collect();
    fs::write(dir.path().join("part-00000.jsonl"), lines).unwrap();
    dir
}

fn simulation(config: PushJobConfig) -> PushSimulation {
    PushSimulation::new(
        SimulationSettings {
            store: STORE.into(),
            partitions: 3,
            replicas_per_datacenter: 2,
            datacenters: vec!["dc-0".into()],
        },
        config,
    )
    .unwrap()
}

#[test]
fn cutover_is_atomic_for_concurrent_readers() {
    let mut config = PushJobConfig::default();
    config.source.compression = CompressionStrategy::Zstd;
    let sim = simulation(config);
    sim.push(generation_source(GENERATION_SCHEMA_V1, 1, 30, 8).path())
        .unwrap();

    let keys: Vec<Vec<u8>> = (0..30).map(|i| string_key(&format!("k{i}"))).collect();
    let request = ComputeRequest::new().project("generation").count("payload", "len");
    let engine = ComputeEngine::new(STORE, sim.serving_view(), sim.schemas(), ComputeConfig::default());
    let stop = AtomicBool::new(false);
    let v2 = generation_source(GENERATION_SCHEMA_V2, 2, 30, 8);

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut seen = Vec::new();
                    while !stop.load(Ordering::Relaxed) {
                        let response = engine.compute(&keys, &request).unwrap();
                        for result in response.results.values() {
                            let KeyResult::Computed(record) = result else {
                                panic!("unexpected {result:?}");
                            };
                            assert!(record.errors.is_empty());
                            assert_eq!(
                                record.projected["generation"],
                                Value::Int(response.version as i32)
                            );
                        }
                        seen.push(response.version);
                    }
                    seen
                })
            })
            .collect();

        let summary = sim.push(v2.path()).unwrap();
        assert_eq!(summary.current_version, Some(2));
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            let seen = reader.join().unwrap();
            // Versions only move forward for a reader.
            assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        }
    });

    assert_eq!(sim.serving_view().current().map(|a| a.version), Some(2));
}

#[test]
fn chunked_values_reassemble_through_the_pipeline() {
    let mut config = PushJobConfig::default();
    config.writer.max_record_size = 64;
    config.writer.chunk_size = 16;
    let sim = simulation(config);

    let summary = sim
        .push(generation_source(GENERATION_SCHEMA_V1, 1, 5, 200).path())
        .unwrap();
    assert_eq!(summary.chunked_records, 5);

    let response = sim
        .compute(
            &[serde_json::json!("k0"), serde_json::json!("k4")],
            &ComputeRequest::new().count("payload", "len"),
        )
        .unwrap();
    for result in response.results.values() {
        let KeyResult::Computed(record) = result else {
            panic!("unexpected {result:?}");
        };
        assert_eq!(record.outputs["len"], ComputeValue::Count(200));
    }
}

#[test]
fn quorum_completes_without_the_third_replica() {
    let log = Arc::new(InMemoryLog::new());
    let topic = topic_name(STORE, 1);
    log.create_topic(&topic, 2).unwrap();

    let (transitions_tx, transitions) = crossbeam_channel::unbounded();
    let monitor = PushMonitor::spawn(
        StatusPolicy {
            replication_factor: 3,
            replica_quorum: 2,
            ..StatusPolicy::default_policy()
        },
        transitions_tx,
    )
    .unwrap();
    let reporter: Arc<dyn ProgressReporter> = Arc::new(monitor.handle());
    monitor.handle().track(STORE, 1, 2);

    let replicas: Vec<_> = (0..3)
        .map(|i| {
            let replica = ServingReplica::new(
                ReplicaId::new(format!("r{i}")),
                "dc-0",
                log.clone(),
                Arc::clone(&reporter),
            );
            replica.subscribe(STORE, 1).unwrap();
            replica
        })
        .collect();

    let mut writer = IngestionWriter::new(log.clone(), &topic, WriterConfig::default()).unwrap();
    writer.accept_value_schema(1);
    writer.broadcast_start_of_push(StartOfPush::default()).unwrap();
    for i in 0..10u8 {
        writer.put(&[i], b"value", 1).unwrap();
    }
    writer.broadcast_end_of_push().unwrap();

    // The third replica never catches up.
    replicas[0].poll();
    replicas[1].poll();

    let terminal = transitions
        .iter()
        .find(|t| t.to.is_terminal())
        .unwrap();
    assert_eq!(terminal.to, ExecutionStatus::Completed);
    assert!(terminal.failing.is_empty());
    monitor.shutdown();
}

#[test]
fn nothing_is_written_after_end_of_push() {
    let log = Arc::new(InMemoryLog::new());
    let topic = topic_name(STORE, 1);
    log.create_topic(&topic, 2).unwrap();
    let mut writer = IngestionWriter::new(log.clone(), &topic, WriterConfig::default()).unwrap();
    writer.accept_value_schema(1);
    writer.broadcast_start_of_push(StartOfPush::default()).unwrap();
    writer.put(b"a", b"1", 1).unwrap();
    writer.broadcast_end_of_push().unwrap();

    let ends: Vec<_> = (0..2).map(|p| log.end_offset(&topic, p).unwrap()).collect();
    assert!(matches!(
        writer.put(b"b", b"2", 1).unwrap(),
        PutOutcome::SealedPartition { .. }
    ));
    let report = writer.broadcast_end_of_push().unwrap();
    assert!(report.newly_sealed.is_empty());
    assert_eq!(report.already_sealed.len(), 2);

    let after: Vec<_> = (0..2).map(|p| log.end_offset(&topic, p).unwrap()).collect();
    assert_eq!(ends, after);
}
