// Store & Version Metadata
//
// Data model for stores and the dataset generations (versions) pushed
// into them. Persistence is delegated to a `MetadataStore`; this module
// only defines the records and their legal lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::compression::CompressionStrategy;

pub mod store;

pub use store::{InMemoryMetadataStore, MetadataStore, NewVersion};

/// Monotonically increasing version number, scoped to a store.
pub type VersionNumber = u32;

/// Shard index within a version's keyspace.
pub type PartitionId = u32;

/// Identifier of a registered value (or key) schema.
pub type SchemaId = i32;

/// Stable identifier for a serving replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the push job that produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushJobId(pub Uuid);

impl PushJobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Name of the log transport topic carrying a version's records.
pub fn topic_name(store: &str, version: VersionNumber) -> String {
    format!("{store}_v{version}")
}

/// Lifecycle of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    /// Push in progress.
    Started,

    /// Every required replica has ingested the version.
    Completed,

    /// Version is the store's current version.
    Online,

    /// Push failed. Terminal.
    Error,

    /// Displaced by a newer version, kept for rollback.
    Retired,
}

impl VersionStatus {
    pub fn can_transition_to(self, next: VersionStatus) -> bool {
        use VersionStatus::*;

        matches!(
            (self, next),
            (Started, Completed | Error)
                | (Completed, Online | Error)
                | (Online, Retired | Error)
                | (Retired, Online)
        )
    }
}

/// One dataset generation of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub store_name: String,
    pub number: VersionNumber,
    pub partition_count: u32,
    pub compression: CompressionStrategy,
    pub value_schema_ids: BTreeSet<SchemaId>,
    pub status: VersionStatus,
    pub push_job_id: PushJobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<Vec<u8>>,
}

impl Version {
    pub fn topic(&self) -> String {
        topic_name(&self.store_name, self.number)
    }
}

/// A named key-value dataset and its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub key_schema_id: SchemaId,
    pub versions: Vec<Version>,
    pub current_version: Option<VersionNumber>,

    /// Highest number ever handed out; numbers are never reused.
    pub largest_used_version: VersionNumber,
}

impl Store {
    pub fn new(name: impl Into<String>, key_schema_id: SchemaId) -> Self {
        Self {
            name: name.into(),
            key_schema_id,
            versions: Vec::new(),
            current_version: None,
            largest_used_version: 0,
        }
    }

    pub fn version(&self, number: VersionNumber) -> Option<&Version> {
        self.versions.iter().find(|v| v.number == number)
    }

    pub fn version_mut(&mut self, number: VersionNumber) -> Option<&mut Version> {
        self.versions.iter_mut().find(|v| v.number == number)
    }

    pub fn current(&self) -> Option<&Version> {
        self.current_version.and_then(|n| self.version(n))
    }
}

/// Errors produced by metadata operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("unknown store `{0}`")]
    UnknownStore(String),

    #[error("unknown version {version} of store `{store}`")]
    UnknownVersion {
        store: String,
        version: VersionNumber,
    },

    #[error("store `{store}` has key schema {existing}, push declared {requested}")]
    KeySchemaMismatch {
        store: String,
        existing: SchemaId,
        requested: SchemaId,
    },

    #[error("illegal status transition for {store} v{version}: {from:?} -> {to:?}")]
    IllegalStatusTransition {
        store: String,
        version: VersionNumber,
        from: VersionStatus,
        to: VersionStatus,
    },

    #[error("current version of `{store}` is {actual:?}, expected {expected:?}")]
    CurrentVersionMismatch {
        store: String,
        expected: Option<VersionNumber>,
        actual: Option<VersionNumber>,
    },
}
