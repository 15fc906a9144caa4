// End-to-End Push Simulation
//
// Runs the whole push pipeline in process:
// validate → write → replicate → aggregate → activate → compute
//
// Every component is the real one; only the log transport, metadata
// store and storage engine are the in-memory implementations. Several
// pushes can run against the same simulation to exercise cutover.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::activation::{
    ActivationCoordinator, ActivationError, ActivationOutcome, InMemoryStoreLock, ServingView,
};
use crate::compression::CompressionStrategy;
use crate::compute::{ComputeEngine, ComputeError, ComputeRequest, ComputeResponse};
use crate::config::{ConfigError, PushJobConfig};
use crate::log::{InMemoryLog, LogTransport, StartOfPush, TransportError};
use crate::meta::{
    InMemoryMetadataStore, MetadataError, MetadataStore, NewVersion, PushJobId, ReplicaId,
    SchemaId, VersionNumber,
};
use crate::replica::{ReplicaError, ReplicaSet, ServingReplica};
use crate::schema::codec::{encode_key, encode_record};
use crate::schema::{AvroStyleCompatibility, CodecError, RegistryError, SchemaRegistry, Value};
use crate::source::dictionary::train_from_source;
use crate::source::{read_records, InputDataInfo, SourceAdapter, ValidationError};
use crate::status::{
    MonitorError, ProgressReporter, PushMonitor, StatusPolicy, StatusTransition,
    VersionStatusSnapshot,
};
use crate::writer::{EndOfPushReport, IngestionWriter, PutOutcome, WriterError};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Slack past the completion timeout before the simulation gives up on
/// the monitor.
const SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// Shape of the simulated serving tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationSettings {
    pub store: String,
    pub partitions: u32,
    pub replicas_per_datacenter: u32,
    pub datacenters: Vec<String>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            store: "store".into(),
            partitions: 4,
            replicas_per_datacenter: 3,
            datacenters: vec!["dc-0".into()],
        }
    }
}

/// Errors that can occur during simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("schema registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("writer: {0}")]
    Writer(#[from] WriterError),

    #[error("replica: {0}")]
    Replica(#[from] ReplicaError),

    #[error("monitor: {0}")]
    Monitor(#[from] MonitorError),

    #[error("activation: {0}")]
    Activation(#[from] ActivationError),

    #[error("compute: {0}")]
    Compute(#[from] ComputeError),

    #[error("record encoding: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid simulation settings: {0}")]
    Settings(String),

    #[error("no key schema registered for `{0}`")]
    UnknownStore(String),

    #[error("version {version} of `{store}` never reached a terminal status")]
    NotConverged {
        store: String,
        version: VersionNumber,
    },
}

/// What one push did.
#[derive(Debug, Clone, Serialize)]
pub struct PushSummary {
    pub store: String,
    pub version: VersionNumber,
    pub push_job_id: PushJobId,
    pub input: InputDataInfo,
    pub schema_id: SchemaId,
    pub compression: CompressionStrategy,
    pub dictionary_size: usize,
    pub records_written: u64,
    pub chunked_records: u64,
    pub end_of_push: EndOfPushReport,
    pub transitions: Vec<StatusTransition>,
    pub status: Option<VersionStatusSnapshot>,
    pub activation: Option<ActivationOutcome>,
    pub current_version: Option<VersionNumber>,
}

pub struct PushSimulation {
    settings: SimulationSettings,
    config: PushJobConfig,
    metadata: Arc<InMemoryMetadataStore>,
    schemas: Arc<SchemaRegistry>,
    transport: Arc<InMemoryLog>,
    replicas: Arc<ReplicaSet>,
    retired: Arc<Mutex<Vec<(String, VersionNumber)>>>,
    coordinator: ActivationCoordinator,
    monitor: PushMonitor,
    transitions: Receiver<StatusTransition>,
    adapter: SourceAdapter,
    policy: StatusPolicy,
}

impl PushSimulation {
    /// Build the serving tier. The status policy takes its replication
    /// factor and required datacenters from `settings`.
    pub fn new(settings: SimulationSettings, config: PushJobConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        if settings.partitions == 0 || settings.replicas_per_datacenter == 0 {
            return Err(SimulationError::Settings(
                "partitions and replicas must be positive".into(),
            ));
        }
        if settings.datacenters.is_empty() {
            return Err(SimulationError::Settings("no datacenter".into()));
        }

        let policy = StatusPolicy {
            replication_factor: settings.replicas_per_datacenter,
            replica_quorum: config
                .status
                .replica_quorum
                .min(settings.replicas_per_datacenter),
            required_datacenters: settings.datacenters.iter().cloned().collect(),
            ..config.status.clone()
        };

        let (transitions_tx, transitions) = crossbeam_channel::unbounded();
        let monitor = PushMonitor::spawn(policy.clone(), transitions_tx)?;
        let reporter: Arc<dyn ProgressReporter> = Arc::new(monitor.handle());

        let transport = Arc::new(InMemoryLog::new());
        let replicas = Arc::new(ReplicaSet::new());
        for datacenter in &settings.datacenters {
            for i in 0..settings.replicas_per_datacenter {
                replicas.add(Arc::new(ServingReplica::new(
                    ReplicaId::new(format!("{datacenter}-r{i}")),
                    datacenter.clone(),
                    transport.clone(),
                    Arc::clone(&reporter),
                )));
            }
        }

        let metadata = Arc::new(InMemoryMetadataStore::new());
        let retired = Arc::new(Mutex::new(Vec::new()));
        let coordinator = ActivationCoordinator::new(
            metadata.clone(),
            Arc::new(InMemoryStoreLock::new()),
            replicas.clone(),
            retired.clone(),
            config.activation.clone(),
        );
        let adapter = SourceAdapter::new(config.source.clone(), Arc::new(AvroStyleCompatibility));

        Ok(Self {
            settings,
            config,
            metadata,
            schemas: Arc::new(SchemaRegistry::new()),
            transport,
            replicas,
            retired,
            coordinator,
            monitor,
            transitions,
            adapter,
            policy,
        })
    }

    pub fn store(&self) -> &str {
        &self.settings.store
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn schemas(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schemas)
    }

    pub fn transport(&self) -> Arc<InMemoryLog> {
        Arc::clone(&self.transport)
    }

    pub fn serving_view(&self) -> ServingView {
        self.coordinator.serving_view(&self.settings.store)
    }

    /// Push one source as a new version and wait for its outcome.
    pub fn push(&self, source: &Path) -> Result<PushSummary, SimulationError> {
        let store = self.settings.store.as_str();
        let partitions = self.settings.partitions;

        let existing: Vec<_> = self
            .schemas
            .value_schemas(store)
            .into_iter()
            .map(|(_, schema)| schema)
            .collect();
        let input = self.adapter.validate(source, &existing)?;
        let key_schema_id = self
            .schemas
            .register_store(store, input.schema_info.key_schema.clone())?;
        let schema_id = self.schemas.add_value_schema(
            store,
            input.schema_info.value_schema.clone(),
            &AvroStyleCompatibility,
        )?;
        self.metadata.get_or_create_store(store, key_schema_id)?;

        let compression = self.config.source.compression;
        let dictionary = match compression {
            CompressionStrategy::ZstdWithDict => train_from_source(
                &input,
                self.config.source.dictionary_sample_budget,
                self.config.source.max_dictionary_size,
            )?,
            CompressionStrategy::NoOp | CompressionStrategy::Zstd => Vec::new(),
        };

        let push_job_id = PushJobId::generate();
        let version = self.metadata.add_version(
            store,
            NewVersion {
                partition_count: partitions,
                compression,
                value_schema_ids: BTreeSet::from([schema_id]),
                push_job_id,
                dictionary: (!dictionary.is_empty()).then(|| dictionary.clone()),
            },
        )?;
        let topic = version.topic();
        info!(store, version = version.number, %topic, ?compression, "push started");

        self.transport.create_topic(&topic, partitions)?;
        self.replicas.subscribe_all(store, version.number)?;
        self.monitor.handle().track(store, version.number, partitions);

        let mut writer =
            IngestionWriter::new(self.transport.clone(), &topic, self.config.writer.clone())?;
        if !dictionary.is_empty() {
            writer = writer.with_dictionary(dictionary.clone());
        }
        writer.accept_value_schema(schema_id);
        writer.broadcast_start_of_push(StartOfPush {
            chunked: self.config.writer.chunking_enabled,
            sorted: false,
            compression,
            debug_info: BTreeMap::from([("push_job_id".to_string(), push_job_id.0.to_string())]),
        })?;

        let (mut records_written, mut chunked_records) = (0, 0);
        for record in read_records(&input) {
            let record = record?;
            let value = encode_record(&input.schema_info.value_schema, &record.value)?;
            if let PutOutcome::Appended(meta) = writer.put(&record.key, &value, schema_id)? {
                records_written += 1;
                if meta.chunk_count > 0 {
                    chunked_records += 1;
                }
            }
        }
        let end_of_push = writer.broadcast_end_of_push()?;

        let (transitions, activation) = self.await_outcome(version.number)?;
        if matches!(activation, Some(ActivationOutcome::MarkedError { .. })) {
            for replica in self.replicas.replicas() {
                replica.unsubscribe(store, version.number);
            }
        }
        self.sweep(Instant::now());

        Ok(PushSummary {
            store: store.to_string(),
            version: version.number,
            push_job_id,
            input,
            schema_id,
            compression,
            dictionary_size: dictionary.len(),
            records_written,
            chunked_records,
            end_of_push,
            transitions,
            status: self.monitor.handle().snapshot(store, version.number),
            activation,
            current_version: self.metadata.get_store(store)?.current_version,
        })
    }

    /// Replicate until the version reaches a terminal status, handing
    /// every transition to the coordinator.
    fn await_outcome(
        &self,
        version: VersionNumber,
    ) -> Result<(Vec<StatusTransition>, Option<ActivationOutcome>), SimulationError> {
        let store = &self.settings.store;
        let give_up = Instant::now() + self.policy.completion_timeout + SETTLE_MARGIN;
        let mut transitions = Vec::new();
        let mut activation = None;

        loop {
            self.replicas.poll_all();
            match self.transitions.recv_timeout(POLL_INTERVAL) {
                Ok(transition) => {
                    let done = &transition.store == store
                        && transition.version == version
                        && transition.to.is_terminal();
                    if let Some(outcome) = self.coordinator.handle_transition(&transition)? {
                        activation = Some(outcome);
                    }
                    transitions.push(transition);
                    if done {
                        return Ok((transitions, activation));
                    }
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() < give_up => {}
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    warn!(store = %store, version, "push did not settle");
                    return Err(SimulationError::NotConverged {
                        store: store.clone(),
                        version,
                    });
                }
            }
        }
    }

    /// Swap back to the previous version while its grace period lasts.
    pub fn rollback(&self) -> Result<ActivationOutcome, SimulationError> {
        let outcome = self.coordinator.rollback(&self.settings.store)?;
        self.drop_retired();
        Ok(outcome)
    }

    /// Retire versions whose grace period ended at `now` and drop their
    /// data from every replica.
    pub fn sweep(&self, now: Instant) -> Vec<(String, VersionNumber)> {
        self.coordinator.sweep_retired(now);
        self.drop_retired()
    }

    fn drop_retired(&self) -> Vec<(String, VersionNumber)> {
        let retired: Vec<_> = self.retired.lock().drain(..).collect();
        for (store, version) in &retired {
            for replica in self.replicas.replicas() {
                replica.unsubscribe(store, *version);
            }
        }
        retired
    }

    /// Compute over keys given as JSON values of the store's key schema.
    pub fn compute(
        &self,
        keys: &[serde_json::Value],
        request: &ComputeRequest,
    ) -> Result<ComputeResponse, SimulationError> {
        let store = &self.settings.store;
        let key_type = self
            .schemas
            .key_schema(store)
            .ok_or_else(|| SimulationError::UnknownStore(store.clone()))?;
        let encoded = keys
            .iter()
            .map(|k| encode_key(&key_type, &Value::from_json(&key_type, k, "key")?))
            .collect::<Result<Vec<_>, _>>()?;

        let engine = ComputeEngine::new(
            store.clone(),
            self.serving_view(),
            self.schemas(),
            self.config.compute.clone(),
        );
        Ok(engine.compute(&encoded, request)?)
    }
}
