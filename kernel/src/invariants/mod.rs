// Invariant Framework
//
// Invariants are pure rules that must hold for every entry of a
// partition's record stream. Violations are detected while replaying,
// *before* the offending record reaches storage.

use crate::log::{LogEntry, MessageType};
use crate::replay::PartitionPhase;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        previous: &PartitionPhase,
        entry: &LogEntry,
        next: &PartitionPhase,
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every built-in stream invariant registered.
    pub fn default_engine() -> Self {
        let mut engine = Self::new();
        engine.register(DataRecordsAreSchemaTagged);
        engine.register(CompressionMatchesStartOfPush);
        engine.register(ChunksRequireChunkedPush);
        engine
    }

    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &PartitionPhase,
        entry: &LogEntry,
        next: &PartitionPhase,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, entry, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        offset: entry.offset,
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invariant `{invariant}` violated at offset {offset}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub offset: u64,
    pub reason: String,
}

/// Values must name the schema that encoded them.
pub struct DataRecordsAreSchemaTagged;

impl Invariant for DataRecordsAreSchemaTagged {
    fn name(&self) -> &'static str {
        "data-records-are-schema-tagged"
    }

    fn validate(&self, _: &PartitionPhase, entry: &LogEntry, _: &PartitionPhase) -> InvariantResult {
        let carries_value = matches!(
            entry.headers.message_type,
            MessageType::Put | MessageType::Chunk { .. } | MessageType::ChunkManifest
        );
        if carries_value && entry.headers.schema_id.is_none() {
            InvariantResult::Fail("value record without schema id".into())
        } else {
            InvariantResult::Pass
        }
    }
}

/// Every data record uses the compression announced by START_OF_PUSH.
pub struct CompressionMatchesStartOfPush;

impl Invariant for CompressionMatchesStartOfPush {
    fn name(&self) -> &'static str {
        "compression-matches-start-of-push"
    }

    fn validate(
        &self,
        previous: &PartitionPhase,
        entry: &LogEntry,
        _: &PartitionPhase,
    ) -> InvariantResult {
        match previous {
            PartitionPhase::Ingesting { compression, .. }
                if !entry.headers.message_type.is_control()
                    && entry.headers.compression != *compression =>
            {
                InvariantResult::Fail(format!(
                    "record compressed with {:?}, push announced {:?}",
                    entry.headers.compression, compression
                ))
            }
            _ => InvariantResult::Pass,
        }
    }
}

pub struct ChunksRequireChunkedPush;

impl Invariant for ChunksRequireChunkedPush {
    fn name(&self) -> &'static str {
        "chunks-require-chunked-push"
    }

    fn validate(
        &self,
        previous: &PartitionPhase,
        entry: &LogEntry,
        _: &PartitionPhase,
    ) -> InvariantResult {
        let is_chunk = matches!(
            entry.headers.message_type,
            MessageType::Chunk { .. } | MessageType::ChunkManifest
        );
        match previous {
            PartitionPhase::Ingesting { chunked: false, .. } if is_chunk => {
                InvariantResult::Fail("chunk record in a push without chunking".into())
            }
            _ => InvariantResult::Pass,
        }
    }
}
