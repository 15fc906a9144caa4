use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::compression::CompressionStrategy;
use crate::meta::{PartitionId, SchemaId};

pub mod transport;

pub use transport::LogTransport;

/// Position of an entry within one partition.
pub type Offset = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    StartOfPush,
    EndOfPush,
}

/// Kind of entry carried on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Control(ControlType),
    Put,
    Delete,

    /// One slice of an oversized value.
    Chunk { index: u32 },

    /// Closes a chunk set; the value becomes readable only now.
    ChunkManifest,
}

impl MessageType {
    pub fn is_control(&self) -> bool {
        matches!(self, MessageType::Control(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub schema_id: Option<SchemaId>,
    pub message_type: MessageType,
    pub compression: CompressionStrategy,
}

impl MessageHeaders {
    pub fn control(control: ControlType, compression: CompressionStrategy) -> Self {
        Self {
            schema_id: None,
            message_type: MessageType::Control(control),
            compression,
        }
    }
}

/// Push-wide settings announced by START_OF_PUSH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOfPush {
    pub chunked: bool,
    pub sorted: bool,
    pub compression: CompressionStrategy,
    #[serde(default)]
    pub debug_info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: Offset,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transient failure on {topic}/{partition}: {reason}")]
    Transient {
        topic: String,
        partition: PartitionId,
        reason: String,
    },

    #[error("fatal failure on {topic}/{partition}: {reason}")]
    Fatal {
        topic: String,
        partition: PartitionId,
        reason: String,
    },

    #[error("unknown topic `{0}`")]
    UnknownTopic(String),

    #[error("partition {partition} out of range for `{topic}` ({partition_count} partitions)")]
    UnknownPartition {
        topic: String,
        partition: PartitionId,
        partition_count: u32,
    },

    #[error("topic `{0}` already exists")]
    TopicExists(String),

    #[error("topic `{0}` needs at least one partition")]
    NoPartitions(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }
}

/// Log transport kept in process memory.
///
/// Supports injecting transient append failures per partition so retry
/// paths can be exercised.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    topics: RwLock<HashMap<String, Vec<Vec<LogEntry>>>>,
    pending_failures: Mutex<HashMap<(String, PartitionId), u32>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends to a partition fail transiently.
    pub fn inject_transient_failures(&self, topic: &str, partition: PartitionId, count: u32) {
        self.pending_failures
            .lock()
            .insert((topic.to_string(), partition), count);
    }

    fn take_injected_failure(&self, topic: &str, partition: PartitionId) -> bool {
        let mut failures = self.pending_failures.lock();
        match failures.get_mut(&(topic.to_string(), partition)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn check_partition(
        topic: &str,
        partitions: &[Vec<LogEntry>],
        partition: PartitionId,
    ) -> Result<(), TransportError> {
        if (partition as usize) < partitions.len() {
            Ok(())
        } else {
            Err(TransportError::UnknownPartition {
                topic: topic.to_string(),
                partition,
                partition_count: partitions.len() as u32,
            })
        }
    }
}

impl LogTransport for InMemoryLog {
    fn create_topic(&self, topic: &str, partition_count: u32) -> Result<(), TransportError> {
        if partition_count == 0 {
            return Err(TransportError::NoPartitions(topic.to_string()));
        }
        let mut topics = self.topics.write();
        if topics.contains_key(topic) {
            return Err(TransportError::TopicExists(topic.to_string()));
        }
        topics.insert(topic.to_string(), vec![Vec::new(); partition_count as usize]);
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<u32, TransportError> {
        self.topics
            .read()
            .get(topic)
            .map(|p| p.len() as u32)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        key: &[u8],
        payload: &[u8],
        headers: MessageHeaders,
    ) -> Result<Offset, TransportError> {
        if self.take_injected_failure(topic, partition) {
            return Err(TransportError::Transient {
                topic: topic.to_string(),
                partition,
                reason: "injected failure".into(),
            });
        }

        let mut topics = self.topics.write();
        let partitions = topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        Self::check_partition(topic, partitions, partition)?;

        let entries = &mut partitions[partition as usize];
        let offset = entries.len() as Offset;
        entries.push(LogEntry {
            offset,
            key: key.to_vec(),
            payload: payload.to_vec(),
            headers,
        });
        Ok(offset)
    }

    fn consume(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let topics = self.topics.read();
        let partitions = topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        Self::check_partition(topic, partitions, partition)?;

        Ok(partitions[partition as usize]
            .iter()
            .skip(from as usize)
            .cloned()
            .collect())
    }

    fn end_offset(&self, topic: &str, partition: PartitionId) -> Result<Offset, TransportError> {
        let topics = self.topics.read();
        let partitions = topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        Self::check_partition(topic, partitions, partition)?;
        Ok(partitions[partition as usize].len() as Offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_headers() -> MessageHeaders {
        MessageHeaders {
            schema_id: Some(1),
            message_type: MessageType::Put,
            compression: CompressionStrategy::NoOp,
        }
    }

    #[test]
    fn append_and_consume_in_order() {
        let log = InMemoryLog::new();
        log.create_topic("features_v1", 2).unwrap();

        assert_eq!(log.append("features_v1", 1, b"a", b"1", put_headers()).unwrap(), 0);
        assert_eq!(log.append("features_v1", 1, b"b", b"2", put_headers()).unwrap(), 1);

        let entries = log.consume("features_v1", 1, 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"b");
        assert_eq!(log.end_offset("features_v1", 0).unwrap(), 0);
    }

    #[test]
    fn injected_failures_are_transient() {
        let log = InMemoryLog::new();
        log.create_topic("features_v1", 1).unwrap();
        log.inject_transient_failures("features_v1", 0, 1);

        let err = log
            .append("features_v1", 0, b"a", b"1", put_headers())
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(log.append("features_v1", 0, b"a", b"1", put_headers()).unwrap(), 0);
    }

    #[test]
    fn unknown_partition_is_not_retryable() {
        let log = InMemoryLog::new();
        log.create_topic("features_v1", 1).unwrap();

        let err = log
            .append("features_v1", 3, b"a", b"1", put_headers())
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, TransportError::UnknownPartition { .. }));
    }

    #[test]
    fn topic_without_partitions_is_refused() {
        let log = InMemoryLog::new();
        assert!(matches!(
            log.create_topic("features_v1", 0),
            Err(TransportError::NoPartitions(_))
        ));
        assert!(matches!(
            log.partition_count("features_v1"),
            Err(TransportError::UnknownTopic(_))
        ));
    }
}
