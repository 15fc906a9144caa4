// Key Partitioner
//
// Writers and readers must agree on the partition owning a key, so the
// mapping is a stable hash of the serialized key bytes.

use twox_hash::XxHash64;

use crate::meta::PartitionId;

const PARTITIONER_SEED: u64 = 0;

/// Partition owning `key` in a version with `partition_count` partitions.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> PartitionId {
    let count = u64::from(partition_count.max(1));
    (XxHash64::oneshot(PARTITIONER_SEED, key) % count) as PartitionId
}
