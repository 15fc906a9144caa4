// Ingestion Writer
//
// Frames one version's records into the partitioned log:
//
//   START_OF_PUSH, data records / chunk sets, END_OF_PUSH
//
// per partition, with nothing after END_OF_PUSH. A writer assumes it is
// the only producer for its version's partitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compression::{CompressionError, Compressor};
use crate::log::{
    ControlType, LogTransport, MessageHeaders, MessageType, Offset, StartOfPush, TransportError,
};
use crate::meta::{PartitionId, SchemaId};
use crate::partitioner::partition_for_key;

pub mod backoff;
pub mod chunking;

pub use backoff::{Backoff, BackoffConfig};
pub use chunking::{split_into_chunks, ChunkAssembler, ChunkError, ChunkManifest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Allow oversized values to be split into chunk sets.
    pub chunking_enabled: bool,

    /// Largest payload (after compression) sent as a single record.
    pub max_record_size: usize,

    /// Size of each chunk of an oversized payload.
    pub chunk_size: usize,

    pub backoff: BackoffConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunking_enabled: true,
            max_record_size: 950 * 1024,
            chunk_size: 950 * 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("START_OF_PUSH already sent for `{0}`")]
    StartOfPushAlreadySent(String),

    #[error("START_OF_PUSH has not been sent for `{topic}` partition {partition}")]
    StartOfPushMissing {
        topic: String,
        partition: PartitionId,
    },

    #[error("record of {size} bytes exceeds the {limit} byte limit and chunking is disabled")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("schema {0} is not accepted by this version")]
    UnknownSchema(SchemaId),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("END_OF_PUSH not acknowledged for `{topic}` partitions {unsealed:?}: {source}")]
    EndOfPushIncomplete {
        topic: String,
        unsealed: Vec<PartitionId>,
        #[source]
        source: TransportError,
    },

    #[error("invalid writer configuration: {0}")]
    InvalidConfig(String),
}

/// Writer-side view of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionState {
    NotStarted,
    Open { messages: u64 },
    Sealed { end_offset: Offset },
}

/// Where an accepted record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordMetadata {
    pub partition: PartitionId,

    /// Offset of the record that makes the value visible (the manifest
    /// for chunked values).
    pub offset: Offset,

    /// Zero for values sent as a single record.
    pub chunk_count: u32,
}

/// Result of a put or delete that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PutOutcome {
    Appended(RecordMetadata),

    /// The partition already has END_OF_PUSH; nothing was written.
    SealedPartition { partition: PartitionId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndOfPushReport {
    pub newly_sealed: Vec<PartitionId>,
    pub already_sealed: Vec<PartitionId>,
}

pub struct IngestionWriter {
    transport: Arc<dyn LogTransport>,
    topic: String,
    config: WriterConfig,
    accepted_schemas: BTreeSet<SchemaId>,
    dictionary: Option<Vec<u8>>,
    start_of_push: Option<StartOfPush>,
    compressor: Compressor,
    partitions: Vec<PartitionState>,
}

impl std::fmt::Debug for IngestionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionWriter")
            .field("topic", &self.topic)
            .field("config", &self.config)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl IngestionWriter {
    pub fn new(
        transport: Arc<dyn LogTransport>,
        topic: impl Into<String>,
        config: WriterConfig,
    ) -> Result<Self, WriterError> {
        if config.chunk_size == 0 || config.max_record_size == 0 {
            return Err(WriterError::InvalidConfig(
                "chunk_size and max_record_size must be positive".into(),
            ));
        }

        let topic = topic.into();
        let partition_count = transport.partition_count(&topic)?;
        if partition_count == 0 {
            return Err(WriterError::InvalidConfig(format!(
                "topic `{topic}` has no partitions"
            )));
        }
        Ok(Self {
            transport,
            topic,
            config,
            accepted_schemas: BTreeSet::new(),
            dictionary: None,
            start_of_push: None,
            compressor: Compressor::new(Default::default(), None),
            partitions: vec![PartitionState::NotStarted; partition_count as usize],
        })
    }

    /// Dictionary used when the push is compressed with `ZstdWithDict`.
    pub fn with_dictionary(mut self, dictionary: Vec<u8>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Allow records tagged with `schema_id`. May be called mid-push when
    /// a compatible schema is registered.
    pub fn accept_value_schema(&mut self, schema_id: SchemaId) {
        self.accepted_schemas.insert(schema_id);
    }

    pub fn partition_state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.partitions.get(partition as usize).copied()
    }

    /// Send START_OF_PUSH to every partition. After a partial failure a
    /// second call completes the remaining partitions; once every
    /// partition is open further calls fail.
    pub fn broadcast_start_of_push(&mut self, config: StartOfPush) -> Result<(), WriterError> {
        if self.start_of_push.is_some() {
            return Err(WriterError::StartOfPushAlreadySent(self.topic.clone()));
        }
        if config.chunked && !self.config.chunking_enabled {
            return Err(WriterError::InvalidConfig(
                "chunked push requested with chunking disabled".into(),
            ));
        }

        let payload = serde_json::to_vec(&config)?;
        let headers = MessageHeaders::control(ControlType::StartOfPush, config.compression);
        for partition in 0..self.partition_count() {
            if self.partitions[partition as usize] != PartitionState::NotStarted {
                continue;
            }
            self.append(partition, &[], &payload, headers)?;
            self.partitions[partition as usize] = PartitionState::Open { messages: 0 };
        }

        self.compressor = Compressor::new(config.compression, self.dictionary.as_deref());
        info!(
            topic = %self.topic,
            partitions = self.partition_count(),
            compression = ?config.compression,
            chunked = config.chunked,
            "START_OF_PUSH broadcast"
        );
        self.start_of_push = Some(config);
        Ok(())
    }

    /// Append a value encoded with `schema_id`.
    pub fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        schema_id: SchemaId,
    ) -> Result<PutOutcome, WriterError> {
        let partition = partition_for_key(key, self.partition_count());
        let messages = match self.writable(partition)? {
            Some(messages) => messages,
            None => return Ok(PutOutcome::SealedPartition { partition }),
        };
        if !self.accepted_schemas.contains(&schema_id) {
            return Err(WriterError::UnknownSchema(schema_id));
        }

        let payload = self.compressor.compress(value)?;
        let headers = MessageHeaders {
            schema_id: Some(schema_id),
            message_type: MessageType::Put,
            compression: self.compressor.strategy(),
        };

        if payload.len() <= self.config.max_record_size {
            let offset = self.append(partition, key, &payload, headers)?;
            self.partitions[partition as usize] = PartitionState::Open {
                messages: messages + 1,
            };
            return Ok(PutOutcome::Appended(RecordMetadata {
                partition,
                offset,
                chunk_count: 0,
            }));
        }

        let chunked = self.start_of_push.as_ref().is_some_and(|s| s.chunked);
        if !chunked {
            return Err(WriterError::RecordTooLarge {
                size: payload.len(),
                limit: self.config.max_record_size,
            });
        }

        let chunks = split_into_chunks(&payload, self.config.chunk_size);
        let manifest = ChunkManifest {
            schema_id,
            chunk_count: chunks.len() as u32,
            total_size: payload.len() as u64,
        }
        .encode()?;

        for (index, chunk) in chunks.iter().enumerate() {
            let headers = MessageHeaders {
                message_type: MessageType::Chunk {
                    index: index as u32,
                },
                ..headers
            };
            self.append(partition, key, chunk, headers)?;
        }
        let offset = self.append(
            partition,
            key,
            &manifest,
            MessageHeaders {
                message_type: MessageType::ChunkManifest,
                ..headers
            },
        )?;

        debug!(
            topic = %self.topic,
            partition,
            chunks = chunks.len(),
            size = payload.len(),
            "value written as chunk set"
        );
        self.partitions[partition as usize] = PartitionState::Open {
            messages: messages + chunks.len() as u64 + 1,
        };
        Ok(PutOutcome::Appended(RecordMetadata {
            partition,
            offset,
            chunk_count: chunks.len() as u32,
        }))
    }

    /// Append a tombstone for `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<PutOutcome, WriterError> {
        let partition = partition_for_key(key, self.partition_count());
        let messages = match self.writable(partition)? {
            Some(messages) => messages,
            None => return Ok(PutOutcome::SealedPartition { partition }),
        };

        let headers = MessageHeaders {
            schema_id: None,
            message_type: MessageType::Delete,
            compression: self.compressor.strategy(),
        };
        let offset = self.append(partition, key, &[], headers)?;
        self.partitions[partition as usize] = PartitionState::Open {
            messages: messages + 1,
        };
        Ok(PutOutcome::Appended(RecordMetadata {
            partition,
            offset,
            chunk_count: 0,
        }))
    }

    /// Seal every open partition with END_OF_PUSH.
    ///
    /// Sealed partitions are skipped, so calling this again after a
    /// partial failure only retries the unsealed subset.
    pub fn broadcast_end_of_push(&mut self) -> Result<EndOfPushReport, WriterError> {
        let compression = match &self.start_of_push {
            Some(sop) => sop.compression,
            None => {
                return Err(WriterError::StartOfPushMissing {
                    topic: self.topic.clone(),
                    partition: 0,
                })
            }
        };
        let headers = MessageHeaders::control(ControlType::EndOfPush, compression);

        let mut report = EndOfPushReport::default();
        let mut unsealed = Vec::new();
        let mut last_error = None;

        for partition in 0..self.partition_count() {
            if let PartitionState::Sealed { .. } = self.partitions[partition as usize] {
                report.already_sealed.push(partition);
                continue;
            }
            match self.append(partition, &[], &[], headers) {
                Ok(end_offset) => {
                    self.partitions[partition as usize] = PartitionState::Sealed { end_offset };
                    report.newly_sealed.push(partition);
                }
                Err(e) => {
                    warn!(topic = %self.topic, partition, e=%e, "END_OF_PUSH not acknowledged");
                    unsealed.push(partition);
                    last_error = Some(e);
                }
            }
        }

        if let Some(source) = last_error {
            return Err(WriterError::EndOfPushIncomplete {
                topic: self.topic.clone(),
                unsealed,
                source,
            });
        }

        info!(
            topic = %self.topic,
            newly_sealed = report.newly_sealed.len(),
            already_sealed = report.already_sealed.len(),
            "END_OF_PUSH broadcast"
        );
        Ok(report)
    }

    /// Message count of an open partition, `None` when sealed.
    fn writable(&self, partition: PartitionId) -> Result<Option<u64>, WriterError> {
        match self.partitions[partition as usize] {
            PartitionState::NotStarted => Err(WriterError::StartOfPushMissing {
                topic: self.topic.clone(),
                partition,
            }),
            PartitionState::Open { messages } => Ok(Some(messages)),
            PartitionState::Sealed { .. } => {
                info!(
                    topic = %self.topic,
                    partition,
                    "write to sealed partition ignored"
                );
                Ok(None)
            }
        }
    }

    fn append(
        &self,
        partition: PartitionId,
        key: &[u8],
        payload: &[u8],
        headers: MessageHeaders,
    ) -> Result<Offset, TransportError> {
        let transport = &self.transport;
        let topic = &self.topic;
        Backoff::new(&self.config.backoff).retry_transient("append", || {
            transport.append(topic, partition, key, payload, headers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;
    use crate::log::{InMemoryLog, LogEntry};
    use std::time::Duration;

    const TOPIC: &str = "features_v1";

    fn config() -> WriterConfig {
        WriterConfig {
            chunking_enabled: true,
            max_record_size: 16,
            chunk_size: 8,
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                base: 2.0,
                max_attempts: 3,
            },
        }
    }

    fn writer(partitions: u32) -> (Arc<InMemoryLog>, IngestionWriter) {
        let log = Arc::new(InMemoryLog::new());
        log.create_topic(TOPIC, partitions).unwrap();
        let mut writer = IngestionWriter::new(log.clone(), TOPIC, config()).unwrap();
        writer.accept_value_schema(1);
        (log, writer)
    }

    /// Transport whose topics report no partitions.
    struct NoPartitions;

    impl LogTransport for NoPartitions {
        fn create_topic(&self, _topic: &str, _partition_count: u32) -> Result<(), TransportError> {
            Ok(())
        }

        fn partition_count(&self, _topic: &str) -> Result<u32, TransportError> {
            Ok(0)
        }

        fn append(
            &self,
            topic: &str,
            _partition: PartitionId,
            _key: &[u8],
            _payload: &[u8],
            _headers: MessageHeaders,
        ) -> Result<Offset, TransportError> {
            Err(TransportError::UnknownTopic(topic.to_string()))
        }

        fn consume(
            &self,
            topic: &str,
            _partition: PartitionId,
            _from: Offset,
        ) -> Result<Vec<LogEntry>, TransportError> {
            Err(TransportError::UnknownTopic(topic.to_string()))
        }

        fn end_offset(&self, topic: &str, _partition: PartitionId) -> Result<Offset, TransportError> {
            Err(TransportError::UnknownTopic(topic.to_string()))
        }
    }

    #[test]
    fn topic_without_partitions_is_rejected() {
        let err = IngestionWriter::new(Arc::new(NoPartitions), TOPIC, config()).unwrap_err();
        assert!(matches!(err, WriterError::InvalidConfig(_)));
    }

    fn started(partitions: u32) -> (Arc<InMemoryLog>, IngestionWriter) {
        let (log, mut writer) = writer(partitions);
        writer
            .broadcast_start_of_push(StartOfPush {
                chunked: true,
                ..Default::default()
            })
            .unwrap();
        (log, writer)
    }

    fn control_count(log: &InMemoryLog, partition: PartitionId, control: ControlType) -> usize {
        log.consume(TOPIC, partition, 0)
            .unwrap()
            .iter()
            .filter(|e| e.headers.message_type == MessageType::Control(control))
            .count()
    }

    #[test]
    fn put_before_start_of_push_is_rejected() {
        let (log, mut writer) = writer(2);

        let err = writer.put(b"k", b"v", 1).unwrap_err();
        assert!(matches!(err, WriterError::StartOfPushMissing { .. }));
        assert_eq!(log.end_offset(TOPIC, 0).unwrap(), 0);
        assert_eq!(log.end_offset(TOPIC, 1).unwrap(), 0);
    }

    #[test]
    fn start_of_push_is_sent_once() {
        let (log, mut writer) = started(3);

        let err = writer
            .broadcast_start_of_push(StartOfPush::default())
            .unwrap_err();
        assert!(matches!(err, WriterError::StartOfPushAlreadySent(_)));
        for p in 0..3 {
            assert_eq!(control_count(&log, p, ControlType::StartOfPush), 1);
        }
    }

    #[test]
    fn put_after_end_of_push_is_a_noop() {
        let (log, mut writer) = started(1);
        writer.put(b"k", b"v", 1).unwrap();
        writer.broadcast_end_of_push().unwrap();
        let end = log.end_offset(TOPIC, 0).unwrap();

        assert_eq!(
            writer.put(b"k2", b"v", 1).unwrap(),
            PutOutcome::SealedPartition { partition: 0 }
        );
        assert_eq!(
            writer.delete(b"k").unwrap(),
            PutOutcome::SealedPartition { partition: 0 }
        );
        assert_eq!(log.end_offset(TOPIC, 0).unwrap(), end);
    }

    #[test]
    fn end_of_push_twice_writes_one_control_record() {
        let (log, mut writer) = started(2);

        let first = writer.broadcast_end_of_push().unwrap();
        let second = writer.broadcast_end_of_push().unwrap();

        assert_eq!(first.newly_sealed, vec![0, 1]);
        assert!(second.newly_sealed.is_empty());
        assert_eq!(second.already_sealed, vec![0, 1]);
        for p in 0..2 {
            assert_eq!(control_count(&log, p, ControlType::EndOfPush), 1);
        }
    }

    #[test]
    fn oversized_value_becomes_chunk_set() {
        let (log, mut writer) = started(1);
        let value = vec![7u8; 20];

        let outcome = writer.put(b"big", &value, 1).unwrap();
        let PutOutcome::Appended(meta) = outcome else {
            panic!("expected append, got {outcome:?}");
        };
        assert_eq!(meta.chunk_count, 3);

        let entries = log.consume(TOPIC, 0, 1).unwrap();
        let types: Vec<_> = entries.iter().map(|e| e.headers.message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageType::Chunk { index: 0 },
                MessageType::Chunk { index: 1 },
                MessageType::Chunk { index: 2 },
                MessageType::ChunkManifest,
            ]
        );
        assert_eq!(entries[3].offset, meta.offset);
        assert_eq!(
            writer.partition_state(0),
            Some(PartitionState::Open { messages: 4 })
        );
    }

    #[test]
    fn oversized_value_without_chunking_is_rejected() {
        let (log, mut writer) = writer(1);
        writer
            .broadcast_start_of_push(StartOfPush::default())
            .unwrap();

        let err = writer.put(b"big", &[0u8; 20], 1).unwrap_err();
        assert!(matches!(err, WriterError::RecordTooLarge { size: 20, limit: 16 }));
        assert_eq!(log.end_offset(TOPIC, 0).unwrap(), 1);
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let (_log, mut writer) = started(1);
        assert!(matches!(
            writer.put(b"k", b"v", 9).unwrap_err(),
            WriterError::UnknownSchema(9)
        ));

        writer.accept_value_schema(9);
        assert!(writer.put(b"k", b"v", 9).is_ok());
    }

    #[test]
    fn transient_failures_do_not_reorder() {
        let (log, mut writer) = started(1);
        log.inject_transient_failures(TOPIC, 0, 2);

        writer.put(b"a", b"1", 1).unwrap();
        writer.put(b"b", b"2", 1).unwrap();

        let keys: Vec<_> = log
            .consume(TOPIC, 0, 1)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn partial_end_of_push_reports_and_retries_unsealed_subset() {
        let (log, mut writer) = started(3);
        log.inject_transient_failures(TOPIC, 1, 3);

        let err = writer.broadcast_end_of_push().unwrap_err();
        let WriterError::EndOfPushIncomplete { unsealed, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(unsealed, vec![1]);

        let retry = writer.broadcast_end_of_push().unwrap();
        assert_eq!(retry.newly_sealed, vec![1]);
        assert_eq!(retry.already_sealed, vec![0, 2]);
        for p in 0..3 {
            assert_eq!(control_count(&log, p, ControlType::EndOfPush), 1);
        }
    }

    #[test]
    fn values_are_compressed_with_push_strategy() {
        let (log, mut writer) = writer(1);
        writer
            .broadcast_start_of_push(StartOfPush {
                compression: CompressionStrategy::Zstd,
                ..Default::default()
            })
            .unwrap();
        writer.put(b"k", b"v", 1).unwrap();

        let entry = &log.consume(TOPIC, 0, 1).unwrap()[0];
        assert_eq!(entry.headers.compression, CompressionStrategy::Zstd);
        let plain = Compressor::new(CompressionStrategy::Zstd, None)
            .decompress(&entry.payload)
            .unwrap();
        assert_eq!(plain, b"v");
    }
}
