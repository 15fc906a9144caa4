// Serving Replica
//
// A storage node's view of the versions it hosts. Each subscribed
// version is replayed partition by partition from the log; after every
// poll the replica reports its progress (offset, seal, failure) to the
// push status aggregator. A completed version is handed to the
// activation coordinator through `ReplicaSet`.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::activation::ServingResolver;
use crate::invariants::InvariantEngine;
use crate::log::{LogTransport, Offset, TransportError};
use crate::meta::{topic_name, PartitionId, ReplicaId, VersionNumber};
use crate::partitioner::partition_for_key;
use crate::replay::{replay_partition, PartitionIngestion};
use crate::status::{ErrorCode, ProgressReport, ProgressReporter};
use crate::storage::{InMemoryVersionStorage, ReadResult, ValueReader, VersionStorage};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica {replica} already hosts version {version} of `{store}`")]
    AlreadySubscribed {
        replica: ReplicaId,
        store: String,
        version: VersionNumber,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What was last reported for a partition, so unchanged progress is not
/// re-sent.
#[derive(Debug, Default)]
struct PartitionSlot {
    cursor: PartitionIngestion,
    reported: Option<(Offset, bool)>,
    error_reported: bool,
}

/// One version hosted by one replica.
pub struct ReplicaVersion {
    store: String,
    version: VersionNumber,
    topic: String,
    storage: InMemoryVersionStorage,
    partitions: Vec<Mutex<PartitionSlot>>,
}

impl ReplicaVersion {
    fn new(store: &str, version: VersionNumber, partition_count: u32) -> Self {
        Self {
            store: store.to_string(),
            version,
            topic: topic_name(store, version),
            storage: InMemoryVersionStorage::new(),
            partitions: (0..partition_count)
                .map(|_| Mutex::new(PartitionSlot::default()))
                .collect(),
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn version(&self) -> VersionNumber {
        self.version
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Every partition is sealed and none failed.
    pub fn is_complete(&self) -> bool {
        self.partitions.iter().all(|p| {
            let slot = p.lock();
            slot.cursor.is_sealed() && slot.cursor.failure().is_none()
        })
    }

    pub fn record_count(&self) -> usize {
        self.storage.record_count()
    }
}

impl ValueReader for ReplicaVersion {
    fn read(&self, key: &[u8]) -> ReadResult {
        let partition = partition_for_key(key, self.partition_count());
        match self.storage.get(partition, key) {
            Some(value) => ReadResult::Found(value),
            None => {
                let pending = self
                    .partitions
                    .get(partition as usize)
                    .is_some_and(|slot| slot.lock().cursor.is_pending(key));
                if pending {
                    ReadResult::NotYetVisible
                } else {
                    ReadResult::NotFound
                }
            }
        }
    }
}

/// A storage node hosting versions of any number of stores.
pub struct ServingReplica {
    id: ReplicaId,
    datacenter: String,
    transport: Arc<dyn LogTransport>,
    reporter: Arc<dyn ProgressReporter>,
    invariants: InvariantEngine,
    versions: RwLock<BTreeMap<(String, VersionNumber), Arc<ReplicaVersion>>>,
}

impl ServingReplica {
    pub fn new(
        id: ReplicaId,
        datacenter: impl Into<String>,
        transport: Arc<dyn LogTransport>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            id,
            datacenter: datacenter.into(),
            transport,
            reporter,
            invariants: InvariantEngine::default_engine(),
            versions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Start hosting a version. Its topic must already exist.
    pub fn subscribe(
        &self,
        store: &str,
        version: VersionNumber,
    ) -> Result<Arc<ReplicaVersion>, ReplicaError> {
        let key = (store.to_string(), version);
        if self.versions.read().contains_key(&key) {
            return Err(ReplicaError::AlreadySubscribed {
                replica: self.id.clone(),
                store: store.to_string(),
                version,
            });
        }

        let partition_count = self
            .transport
            .partition_count(&topic_name(store, version))?;
        let hosted = Arc::new(ReplicaVersion::new(store, version, partition_count));
        self.versions.write().insert(key, Arc::clone(&hosted));
        info!(replica = %self.id, store, version, partition_count, "subscribed to version");
        Ok(hosted)
    }

    /// Drop a version's data.
    pub fn unsubscribe(&self, store: &str, version: VersionNumber) -> bool {
        let removed = self
            .versions
            .write()
            .remove(&(store.to_string(), version))
            .is_some();
        if removed {
            info!(replica = %self.id, store, version, "version dropped");
        }
        removed
    }

    pub fn hosted(&self, store: &str, version: VersionNumber) -> Option<Arc<ReplicaVersion>> {
        self.versions.read().get(&(store.to_string(), version)).cloned()
    }

    /// Replay new log entries of every hosted version and report progress.
    /// Returns the number of entries applied.
    pub fn poll(&self) -> usize {
        let hosted: Vec<_> = self.versions.read().values().cloned().collect();
        let mut applied = 0;
        for version in hosted {
            for (partition, slot) in version.partitions.iter().enumerate() {
                applied += self.poll_partition(&version, partition as PartitionId, &mut slot.lock());
            }
        }
        applied
    }

    fn poll_partition(
        &self,
        version: &ReplicaVersion,
        partition: PartitionId,
        slot: &mut PartitionSlot,
    ) -> usize {
        if slot.error_reported {
            return 0;
        }

        let report = |offset, sealed, error| ProgressReport {
            store: version.store.clone(),
            version: version.version,
            partition,
            replica_id: self.id.clone(),
            datacenter: self.datacenter.clone(),
            offset,
            sealed,
            error,
        };

        match replay_partition(
            self.transport.as_ref(),
            &version.topic,
            partition,
            &mut slot.cursor,
            &self.invariants,
            &version.storage,
        ) {
            Ok(progress) => {
                let position = (progress.offset, progress.sealed);
                if slot.reported != Some(position) && progress.offset > 0 {
                    self.reporter
                        .report(report(progress.offset, progress.sealed, None));
                    slot.reported = Some(position);
                }
                progress.applied
            }
            Err(e) if slot.cursor.failure().is_none() => {
                // Transport errors leave the cursor intact; retry next poll.
                debug!(replica = %self.id, topic = %version.topic, partition, e=%e, "poll failed");
                0
            }
            Err(e) => {
                warn!(replica = %self.id, topic = %version.topic, partition, e=%e, "partition failed");
                self.reporter.report(report(
                    slot.cursor.next_offset(),
                    false,
                    Some(ErrorCode(e.to_string())),
                ));
                slot.error_reported = true;
                0
            }
        }
    }

    /// Poll until `shutdown` fires or its sender is dropped.
    pub fn run(&self, interval: Duration, shutdown: Receiver<()>) {
        loop {
            self.poll();
            match shutdown.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!(replica = %self.id, "replica stopped");
    }
}

/// The serving tier as seen by the activation coordinator.
#[derive(Default)]
pub struct ReplicaSet {
    replicas: RwLock<Vec<Arc<ServingReplica>>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, replica: Arc<ServingReplica>) {
        self.replicas.write().push(replica);
    }

    pub fn replicas(&self) -> Vec<Arc<ServingReplica>> {
        self.replicas.read().clone()
    }

    /// Subscribe every replica to a version.
    pub fn subscribe_all(&self, store: &str, version: VersionNumber) -> Result<(), ReplicaError> {
        for replica in self.replicas.read().iter() {
            replica.subscribe(store, version)?;
        }
        Ok(())
    }

    pub fn poll_all(&self) -> usize {
        self.replicas.read().iter().map(|r| r.poll()).sum()
    }
}

impl ServingResolver for ReplicaSet {
    fn resolve(&self, store: &str, version: VersionNumber) -> Option<Arc<dyn ValueReader>> {
        self.replicas
            .read()
            .iter()
            .filter_map(|r| r.hosted(store, version))
            .find(|v| v.is_complete())
            .map(|v| v as Arc<dyn ValueReader>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{InMemoryLog, MessageHeaders, MessageType, StartOfPush};
    use crate::storage::StoredValue;
    use crate::writer::{IngestionWriter, WriterConfig};

    const STORE: &str = "features";

    fn setup(partitions: u32) -> (Arc<InMemoryLog>, IngestionWriter, Arc<Mutex<Vec<ProgressReport>>>) {
        let log = Arc::new(InMemoryLog::new());
        log.create_topic(&topic_name(STORE, 1), partitions).unwrap();
        let mut writer = IngestionWriter::new(
            log.clone(),
            &topic_name(STORE, 1),
            WriterConfig {
                max_record_size: 16,
                chunk_size: 8,
                ..WriterConfig::default()
            },
        )
        .unwrap();
        writer.accept_value_schema(1);
        (log, writer, Arc::new(Mutex::new(Vec::new())))
    }

    fn replica(log: &Arc<InMemoryLog>, reports: &Arc<Mutex<Vec<ProgressReport>>>, id: &str) -> ServingReplica {
        ServingReplica::new(ReplicaId::new(id), "dc-0", log.clone(), reports.clone())
    }

    #[test]
    fn replays_push_and_reports_seal() {
        let (log, mut writer, reports) = setup(2);
        let replica = replica(&log, &reports, "r1");
        let hosted = replica.subscribe(STORE, 1).unwrap();

        writer.broadcast_start_of_push(StartOfPush::default()).unwrap();
        writer.put(b"a", b"1", 1).unwrap();
        writer.put(b"b", b"2", 1).unwrap();
        replica.poll();
        assert!(!hosted.is_complete());

        writer.broadcast_end_of_push().unwrap();
        replica.poll();

        assert!(hosted.is_complete());
        assert_eq!(hosted.record_count(), 2);
        assert_eq!(
            hosted.read(b"a"),
            ReadResult::Found(StoredValue {
                schema_id: 1,
                payload: b"1".to_vec()
            })
        );
        assert_eq!(hosted.read(b"zzz"), ReadResult::NotFound);

        let reports = reports.lock();
        assert!(reports.iter().filter(|r| r.sealed).count() == 2);
        assert!(reports.iter().all(|r| r.error.is_none()));
    }

    #[test]
    fn unchanged_progress_is_not_reported_again() {
        let (log, mut writer, reports) = setup(1);
        let replica = replica(&log, &reports, "r1");
        replica.subscribe(STORE, 1).unwrap();

        writer.broadcast_start_of_push(StartOfPush::default()).unwrap();
        replica.poll();
        replica.poll();
        assert_eq!(reports.lock().len(), 1);
    }

    #[test]
    fn partial_chunk_set_is_not_visible() {
        let (log, mut writer, reports) = setup(1);
        let replica = replica(&log, &reports, "r1");
        let hosted = replica.subscribe(STORE, 1).unwrap();
        writer
            .broadcast_start_of_push(StartOfPush {
                chunked: true,
                ..Default::default()
            })
            .unwrap();
        writer.put(b"big", &[7u8; 40], 1).unwrap();

        // Replay only up to the first chunk.
        let topic = topic_name(STORE, 1);
        {
            let mut slot = hosted.partitions[0].lock();
            let sop_and_chunk = InMemoryLog::new();
            sop_and_chunk.create_topic(&topic, 1).unwrap();
            for entry in log.consume(&topic, 0, 0).unwrap().into_iter().take(2) {
                sop_and_chunk
                    .append(&topic, 0, &entry.key, &entry.payload, entry.headers)
                    .unwrap();
            }
            replay_partition(
                &sop_and_chunk,
                &topic,
                0,
                &mut slot.cursor,
                &InvariantEngine::default_engine(),
                &hosted.storage,
            )
            .unwrap();
        }
        assert_eq!(hosted.read(b"big"), ReadResult::NotYetVisible);

        replica.poll();
        assert!(matches!(hosted.read(b"big"), ReadResult::Found(v) if v.payload == vec![7u8; 40]));
    }

    #[test]
    fn protocol_violation_is_reported_once_as_error() {
        let (log, _writer, reports) = setup(1);
        let replica = replica(&log, &reports, "r1");
        replica.subscribe(STORE, 1).unwrap();

        // Data before START_OF_PUSH.
        log.append(
            &topic_name(STORE, 1),
            0,
            b"k",
            b"v",
            MessageHeaders {
                schema_id: Some(1),
                message_type: MessageType::Put,
                compression: Default::default(),
            },
        )
        .unwrap();
        replica.poll();
        replica.poll();

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.is_some());
        assert!(!reports[0].sealed);
    }

    #[test]
    fn resolver_returns_only_complete_versions() {
        let (log, mut writer, reports) = setup(1);
        let set = ReplicaSet::new();
        set.add(Arc::new(replica(&log, &reports, "r1")));
        set.subscribe_all(STORE, 1).unwrap();

        writer.broadcast_start_of_push(StartOfPush::default()).unwrap();
        writer.put(b"a", b"1", 1).unwrap();
        set.poll_all();
        assert!(set.resolve(STORE, 1).is_none());

        writer.broadcast_end_of_push().unwrap();
        set.poll_all();
        let reader = set.resolve(STORE, 1).unwrap();
        assert!(matches!(reader.read(b"a"), ReadResult::Found(_)));
        assert!(set.resolve(STORE, 2).is_none());
    }

    #[test]
    fn double_subscription_is_rejected() {
        let (log, _writer, reports) = setup(1);
        let replica = replica(&log, &reports, "r1");
        replica.subscribe(STORE, 1).unwrap();
        assert!(matches!(
            replica.subscribe(STORE, 1),
            Err(ReplicaError::AlreadySubscribed { .. })
        ));
        assert!(replica.unsubscribe(STORE, 1));
        assert!(replica.hosted(STORE, 1).is_none());
    }
}
