// Storage Engine Abstraction
//
// Per-version record storage on a serving node. Payloads are kept exactly
// as they travelled on the log (compressed, schema-tagged); decoding is
// left to readers.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::meta::{PartitionId, SchemaId};

/// A persisted value and the id of the schema that encoded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub schema_id: SchemaId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Found(StoredValue),
    NotFound,

    /// Part of a chunked value has arrived but not its manifest.
    NotYetVisible,
}

/// Read access to one version's records, by key.
pub trait ValueReader: Send + Sync {
    fn read(&self, key: &[u8]) -> ReadResult;
}

/// Storage for one version's records.
///
/// Properties required from implementations:
/// - A `put` is visible to every later `get` on the same partition
/// - `delete` of an absent key is a no-op
pub trait VersionStorage: Send + Sync {
    fn put(&self, partition: PartitionId, key: &[u8], value: StoredValue);

    fn delete(&self, partition: PartitionId, key: &[u8]);

    fn get(&self, partition: PartitionId, key: &[u8]) -> Option<StoredValue>;

    fn record_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryVersionStorage {
    partitions: RwLock<HashMap<PartitionId, HashMap<Vec<u8>, StoredValue>>>,
}

impl InMemoryVersionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStorage for InMemoryVersionStorage {
    fn put(&self, partition: PartitionId, key: &[u8], value: StoredValue) {
        self.partitions
            .write()
            .entry(partition)
            .or_default()
            .insert(key.to_vec(), value);
    }

    fn delete(&self, partition: PartitionId, key: &[u8]) {
        if let Some(records) = self.partitions.write().get_mut(&partition) {
            records.remove(key);
        }
    }

    fn get(&self, partition: PartitionId, key: &[u8]) -> Option<StoredValue> {
        self.partitions
            .read()
            .get(&partition)
            .and_then(|records| records.get(key).cloned())
    }

    fn record_count(&self) -> usize {
        self.partitions.read().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let storage = InMemoryVersionStorage::new();
        let value = StoredValue {
            schema_id: 2,
            payload: b"payload".to_vec(),
        };

        storage.put(1, b"k", value.clone());
        assert_eq!(storage.get(1, b"k"), Some(value));
        assert_eq!(storage.get(0, b"k"), None);
        assert_eq!(storage.record_count(), 1);

        storage.delete(1, b"k");
        storage.delete(3, b"absent");
        assert_eq!(storage.get(1, b"k"), None);
        assert_eq!(storage.record_count(), 0);
    }
}
