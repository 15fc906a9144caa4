// Deterministic Replay Engine
//
// Replays a partition's log entries into version storage while enforcing
// the stream phase machine and invariants. Replay is incremental: a
// cursor remembers where the previous call stopped.

use tracing::{debug, warn};

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::log::{LogEntry, LogTransport, MessageType, Offset, TransportError};
use crate::meta::PartitionId;
use crate::storage::{StoredValue, VersionStorage};
use crate::writer::{ChunkAssembler, ChunkError, ChunkManifest};

pub mod phase;

pub use phase::{PartitionPhase, PhaseError, PhaseMachine};

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("stream error: {0}")]
    Phase(#[from] PhaseError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("chunk error at offset {offset}: {source}")]
    Chunk {
        offset: Offset,
        #[source]
        source: ChunkError,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("partition previously failed: {0}")]
    Failed(String),
}

/// Replay position and reassembly state of one partition.
#[derive(Debug, Default)]
pub struct PartitionIngestion {
    machine: PhaseMachine,
    next_offset: Offset,
    assembler: ChunkAssembler,
    failure: Option<String>,
}

impl PartitionIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &PartitionPhase {
        self.machine.current()
    }

    pub fn next_offset(&self) -> Offset {
        self.next_offset
    }

    pub fn is_sealed(&self) -> bool {
        self.phase() == &PartitionPhase::Sealed
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// A chunk set for `key` has started but its manifest has not arrived.
    pub fn is_pending(&self, key: &[u8]) -> bool {
        self.assembler.is_pending(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayProgress {
    /// Offset of the next entry to replay.
    pub offset: Offset,
    pub sealed: bool,
    pub applied: usize,
}

/// Replay every entry of `partition` not yet seen by `cursor`.
///
/// The first failure is recorded on the cursor and the partition stops
/// making progress.
pub fn replay_partition(
    transport: &dyn LogTransport,
    topic: &str,
    partition: PartitionId,
    cursor: &mut PartitionIngestion,
    invariants: &InvariantEngine,
    storage: &dyn VersionStorage,
) -> Result<ReplayProgress, ReplayError> {
    if let Some(reason) = &cursor.failure {
        return Err(ReplayError::Failed(reason.clone()));
    }

    let entries = transport.consume(topic, partition, cursor.next_offset)?;
    let mut applied = 0;

    for entry in &entries {
        if let Err(e) = apply_entry(partition, cursor, entry, invariants, storage) {
            warn!(topic, partition, offset = entry.offset, e=%e, "replay halted");
            cursor.failure = Some(e.to_string());
            return Err(e);
        }
        cursor.next_offset = entry.offset + 1;
        applied += 1;
    }

    if applied > 0 {
        debug!(topic, partition, applied, offset = cursor.next_offset, "partition replayed");
    }
    Ok(ReplayProgress {
        offset: cursor.next_offset,
        sealed: cursor.is_sealed(),
        applied,
    })
}

fn apply_entry(
    partition: PartitionId,
    cursor: &mut PartitionIngestion,
    entry: &LogEntry,
    invariants: &InvariantEngine,
    storage: &dyn VersionStorage,
) -> Result<(), ReplayError> {
    // Apply event to state machine
    let previous = cursor.machine.current().clone();
    cursor.machine.apply(entry)?;

    // Enforce invariants
    invariants.evaluate(&previous, entry, cursor.machine.current())?;

    let chunk_error = |source| ReplayError::Chunk {
        offset: entry.offset,
        source,
    };

    match entry.headers.message_type {
        MessageType::Control(_) => {}
        MessageType::Put => {
            cursor.assembler.discard(&entry.key);
            storage.put(
                partition,
                &entry.key,
                StoredValue {
                    schema_id: entry.headers.schema_id.unwrap_or_default(),
                    payload: entry.payload.clone(),
                },
            );
        }
        MessageType::Delete => {
            cursor.assembler.discard(&entry.key);
            storage.delete(partition, &entry.key);
        }
        MessageType::Chunk { index } => cursor
            .assembler
            .accept_chunk(&entry.key, index, &entry.payload)
            .map_err(chunk_error)?,
        MessageType::ChunkManifest => {
            let manifest = ChunkManifest::decode(&entry.payload)
                .map_err(|e| chunk_error(ChunkError::Manifest(e.to_string())))?;
            let payload = cursor
                .assembler
                .accept_manifest(&entry.key, &manifest)
                .map_err(chunk_error)?;
            storage.put(
                partition,
                &entry.key,
                StoredValue {
                    schema_id: manifest.schema_id,
                    payload,
                },
            );
        }
    }
    Ok(())
}
