// Log Transport Abstraction
//
// Defines the contract of the ordered, partitioned log that carries
// pushes from writers to serving replicas. Implementations may be
// backed by any durable log service.
//
// This module defines *interfaces only*.

use super::{LogEntry, MessageHeaders, Offset, TransportError};
use crate::meta::PartitionId;

/// Ordered, partitioned, append-only log.
///
/// Properties required from implementations:
/// - Append-only
/// - Totally ordered within a partition
/// - Durable once `append` returns an offset
///
/// Implementations MUST NOT:
/// - Reorder entries of one partition
/// - Mutate appended entries
///
/// No ordering is promised across partitions.
pub trait LogTransport: Send + Sync {
    fn create_topic(&self, topic: &str, partition_count: u32) -> Result<(), TransportError>;

    fn partition_count(&self, topic: &str) -> Result<u32, TransportError>;

    /// Append an entry and return its offset.
    ///
    /// `TransportError::Transient` means nothing was appended and the
    /// call may be retried.
    fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        key: &[u8],
        payload: &[u8],
        headers: MessageHeaders,
    ) -> Result<Offset, TransportError>;

    /// Entries of one partition starting at `from`, in order.
    fn consume(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
    ) -> Result<Vec<LogEntry>, TransportError>;

    /// Offset the next appended entry will receive.
    fn end_offset(&self, topic: &str, partition: PartitionId) -> Result<Offset, TransportError>;
}
