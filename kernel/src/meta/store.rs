// Metadata Storage Abstraction
//
// Defines the persistence contract for store and version records.
// Production deployments back this with a replicated metadata service;
// the in-memory implementation serves tests and simulation.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

use super::{
    MetadataError, PushJobId, SchemaId, Store, Version, VersionNumber, VersionStatus,
};
use crate::compression::CompressionStrategy;

/// Parameters of a version about to be pushed.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub partition_count: u32,
    pub compression: CompressionStrategy,
    pub value_schema_ids: BTreeSet<SchemaId>,
    pub push_job_id: PushJobId,
    pub dictionary: Option<Vec<u8>>,
}

/// Storage backend for store metadata.
///
/// Properties required from implementations:
/// - Version numbers strictly increase per store and are never reused
/// - Status changes respect `VersionStatus::can_transition_to`
/// - `compare_and_set_current_version` is atomic per store
pub trait MetadataStore: Send + Sync {
    /// Return the store, creating it on first push.
    fn get_or_create_store(&self, name: &str, key_schema_id: SchemaId)
        -> Result<Store, MetadataError>;

    fn get_store(&self, name: &str) -> Result<Store, MetadataError>;

    /// Allocate the next version number and record the version as `Started`.
    fn add_version(&self, store: &str, version: NewVersion) -> Result<Version, MetadataError>;

    fn set_version_status(
        &self,
        store: &str,
        version: VersionNumber,
        status: VersionStatus,
    ) -> Result<(), MetadataError>;

    /// Accept an additional value schema for a version mid-push.
    fn add_value_schema(
        &self,
        store: &str,
        version: VersionNumber,
        schema_id: SchemaId,
    ) -> Result<(), MetadataError>;

    /// Swap the current-version pointer.
    ///
    /// Only the activation coordinator calls this.
    fn compare_and_set_current_version(
        &self,
        store: &str,
        expected: Option<VersionNumber>,
        next: VersionNumber,
    ) -> Result<(), MetadataError>;
}

/// Metadata store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    stores: RwLock<HashMap<String, Store>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_store<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Store) -> Result<T, MetadataError>,
    ) -> Result<T, MetadataError> {
        let mut stores = self.stores.write();
        let store = stores
            .get_mut(name)
            .ok_or_else(|| MetadataError::UnknownStore(name.to_string()))?;
        f(store)
    }
}

fn version_mut<'a>(
    store: &'a mut Store,
    number: VersionNumber,
) -> Result<&'a mut Version, MetadataError> {
    let name = store.name.clone();
    store
        .version_mut(number)
        .ok_or(MetadataError::UnknownVersion {
            store: name,
            version: number,
        })
}

impl MetadataStore for InMemoryMetadataStore {
    fn get_or_create_store(
        &self,
        name: &str,
        key_schema_id: SchemaId,
    ) -> Result<Store, MetadataError> {
        let mut stores = self.stores.write();
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| Store::new(name, key_schema_id));

        if store.key_schema_id != key_schema_id {
            return Err(MetadataError::KeySchemaMismatch {
                store: name.to_string(),
                existing: store.key_schema_id,
                requested: key_schema_id,
            });
        }
        Ok(store.clone())
    }

    fn get_store(&self, name: &str) -> Result<Store, MetadataError> {
        self.stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownStore(name.to_string()))
    }

    fn add_version(&self, store: &str, version: NewVersion) -> Result<Version, MetadataError> {
        self.with_store(store, |s| {
            s.largest_used_version += 1;
            let created = Version {
                store_name: s.name.clone(),
                number: s.largest_used_version,
                partition_count: version.partition_count,
                compression: version.compression,
                value_schema_ids: version.value_schema_ids,
                status: VersionStatus::Started,
                push_job_id: version.push_job_id,
                dictionary: version.dictionary,
            };
            s.versions.push(created.clone());
            Ok(created)
        })
    }

    fn set_version_status(
        &self,
        store: &str,
        version: VersionNumber,
        status: VersionStatus,
    ) -> Result<(), MetadataError> {
        self.with_store(store, |s| {
            let v = version_mut(s, version)?;
            if v.status == status {
                return Ok(());
            }
            if !v.status.can_transition_to(status) {
                return Err(MetadataError::IllegalStatusTransition {
                    store: v.store_name.clone(),
                    version,
                    from: v.status,
                    to: status,
                });
            }
            v.status = status;
            Ok(())
        })
    }

    fn add_value_schema(
        &self,
        store: &str,
        version: VersionNumber,
        schema_id: SchemaId,
    ) -> Result<(), MetadataError> {
        self.with_store(store, |s| {
            version_mut(s, version)?.value_schema_ids.insert(schema_id);
            Ok(())
        })
    }

    fn compare_and_set_current_version(
        &self,
        store: &str,
        expected: Option<VersionNumber>,
        next: VersionNumber,
    ) -> Result<(), MetadataError> {
        self.with_store(store, |s| {
            if s.current_version != expected {
                return Err(MetadataError::CurrentVersionMismatch {
                    store: s.name.clone(),
                    expected,
                    actual: s.current_version,
                });
            }
            version_mut(s, next)?;
            s.current_version = Some(next);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_version() -> NewVersion {
        NewVersion {
            partition_count: 4,
            compression: CompressionStrategy::NoOp,
            value_schema_ids: BTreeSet::from([1]),
            push_job_id: PushJobId::generate(),
            dictionary: None,
        }
    }

    #[test]
    fn version_numbers_are_never_reused() {
        let meta = InMemoryMetadataStore::new();
        meta.get_or_create_store("features", 1).unwrap();

        let v1 = meta.add_version("features", new_version()).unwrap();
        meta.set_version_status("features", v1.number, VersionStatus::Error)
            .unwrap();
        let v2 = meta.add_version("features", new_version()).unwrap();

        assert_eq!(v1.number, 1);
        assert_eq!(v2.number, 2);
        assert_eq!(v2.topic(), "features_v2");
    }

    #[test]
    fn key_schema_is_fixed_at_creation() {
        let meta = InMemoryMetadataStore::new();
        meta.get_or_create_store("features", 1).unwrap();

        let err = meta.get_or_create_store("features", 2).unwrap_err();
        assert!(matches!(err, MetadataError::KeySchemaMismatch { .. }));
    }

    #[test]
    fn current_version_swap_is_compare_and_set() {
        let meta = InMemoryMetadataStore::new();
        meta.get_or_create_store("features", 1).unwrap();
        let v1 = meta.add_version("features", new_version()).unwrap();

        meta.compare_and_set_current_version("features", None, v1.number)
            .unwrap();
        let err = meta
            .compare_and_set_current_version("features", None, v1.number)
            .unwrap_err();

        assert_eq!(
            err,
            MetadataError::CurrentVersionMismatch {
                store: "features".into(),
                expected: None,
                actual: Some(1),
            }
        );
    }

    #[test]
    fn illegal_status_transition_is_rejected() {
        let meta = InMemoryMetadataStore::new();
        meta.get_or_create_store("features", 1).unwrap();
        let v1 = meta.add_version("features", new_version()).unwrap();

        let err = meta
            .set_version_status("features", v1.number, VersionStatus::Online)
            .unwrap_err();
        assert!(matches!(err, MetadataError::IllegalStatusTransition { .. }));
    }
}
