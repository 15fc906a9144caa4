// Value Chunking
//
// Oversized values travel as an ordered chunk set: chunk records with
// consecutive indexes followed by one manifest record. Readers buffer
// chunks per key and expose the value only once the manifest arrives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::meta::SchemaId;

/// Trailing record of a chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub schema_id: SchemaId,
    pub chunk_count: u32,
    pub total_size: u64,
}

impl ChunkManifest {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Split `value` into slices of at most `chunk_size` bytes.
pub fn split_into_chunks(value: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    value.chunks(chunk_size.max(1)).collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk {index} arrived out of order, expected {expected}")]
    OutOfOrder { index: u32, expected: u32 },

    #[error("manifest without pending chunks")]
    ManifestWithoutChunks,

    #[error("manifest announces {expected} chunks, {actual} received")]
    CountMismatch { expected: u32, actual: u32 },

    #[error("manifest announces {expected} bytes, {actual} received")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

#[derive(Debug, Default)]
struct PendingChunks {
    next_index: u32,
    bytes: Vec<u8>,
}

/// Per-partition buffer of incomplete chunk sets, keyed by record key.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    pending: HashMap<Vec<u8>, PendingChunks>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one chunk. Index 0 discards any earlier incomplete set for
    /// the key, since a retried write starts over.
    pub fn accept_chunk(&mut self, key: &[u8], index: u32, bytes: &[u8]) -> Result<(), ChunkError> {
        if index == 0 {
            self.pending.insert(key.to_vec(), PendingChunks::default());
        }

        let pending = self
            .pending
            .get_mut(key)
            .ok_or(ChunkError::OutOfOrder { index, expected: 0 })?;
        if pending.next_index != index {
            return Err(ChunkError::OutOfOrder {
                index,
                expected: pending.next_index,
            });
        }
        pending.next_index += 1;
        pending.bytes.extend_from_slice(bytes);
        Ok(())
    }

    /// Close the set for `key` and return the reassembled value.
    pub fn accept_manifest(
        &mut self,
        key: &[u8],
        manifest: &ChunkManifest,
    ) -> Result<Vec<u8>, ChunkError> {
        let pending = self
            .pending
            .remove(key)
            .ok_or(ChunkError::ManifestWithoutChunks)?;

        if pending.next_index != manifest.chunk_count {
            return Err(ChunkError::CountMismatch {
                expected: manifest.chunk_count,
                actual: pending.next_index,
            });
        }
        if pending.bytes.len() as u64 != manifest.total_size {
            return Err(ChunkError::SizeMismatch {
                expected: manifest.total_size,
                actual: pending.bytes.len() as u64,
            });
        }
        Ok(pending.bytes)
    }

    pub fn is_pending(&self, key: &[u8]) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop a partial set, e.g. when a plain put or delete supersedes it.
    pub fn discard(&mut self, key: &[u8]) {
        self.pending.remove(key);
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }
}
