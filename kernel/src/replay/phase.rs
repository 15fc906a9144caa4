// Partition Stream State Machine
//
// Derives the phase of one partition's record stream from its entries.
// Pure and deterministic: the same entries always yield the same phase.

use crate::compression::CompressionStrategy;
use crate::log::{ControlType, LogEntry, MessageType, StartOfPush};

/// Where a partition's stream is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionPhase {
    /// Nothing but START_OF_PUSH is legal.
    AwaitingStartOfPush,

    /// Data records are accepted.
    Ingesting {
        compression: CompressionStrategy,
        chunked: bool,
    },

    /// END_OF_PUSH seen. Terminal.
    Sealed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("illegal stream transition at offset {offset}: {detail}")]
    IllegalTransition { offset: u64, detail: String },

    #[error("unreadable START_OF_PUSH at offset {offset}: {detail}")]
    InvalidStartOfPush { offset: u64, detail: String },
}

#[derive(Debug)]
pub struct PhaseMachine {
    phase: PartitionPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: PartitionPhase::AwaitingStartOfPush,
        }
    }

    pub fn apply(&mut self, entry: &LogEntry) -> Result<(), PhaseError> {
        use MessageType::*;
        use PartitionPhase::*;

        self.phase = match (&self.phase, &entry.headers.message_type) {
            (AwaitingStartOfPush, Control(ControlType::StartOfPush)) => {
                let sop: StartOfPush = serde_json::from_slice(&entry.payload).map_err(|e| {
                    PhaseError::InvalidStartOfPush {
                        offset: entry.offset,
                        detail: e.to_string(),
                    }
                })?;
                Ingesting {
                    compression: sop.compression,
                    chunked: sop.chunked,
                }
            }

            (Ingesting { .. }, Put | Delete | Chunk { .. } | ChunkManifest) => self.phase.clone(),

            (Ingesting { .. }, Control(ControlType::EndOfPush)) => Sealed,

            (phase, message) => {
                return Err(PhaseError::IllegalTransition {
                    offset: entry.offset,
                    detail: format!("cannot apply {message:?} while {phase:?}"),
                })
            }
        };

        Ok(())
    }

    pub fn current(&self) -> &PartitionPhase {
        &self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MessageHeaders;

    fn entry(offset: u64, message_type: MessageType, payload: Vec<u8>) -> LogEntry {
        LogEntry {
            offset,
            key: vec![],
            payload,
            headers: MessageHeaders {
                schema_id: Some(1),
                message_type,
                compression: CompressionStrategy::NoOp,
            },
        }
    }

    fn sop(offset: u64) -> LogEntry {
        let payload = serde_json::to_vec(&StartOfPush::default()).unwrap();
        entry(offset, MessageType::Control(ControlType::StartOfPush), payload)
    }

    #[test]
    fn valid_lifecycle() {
        let mut m = PhaseMachine::new();

        m.apply(&sop(0)).unwrap();
        assert!(matches!(m.current(), PartitionPhase::Ingesting { .. }));

        m.apply(&entry(1, MessageType::Put, vec![])).unwrap();
        m.apply(&entry(2, MessageType::Control(ControlType::EndOfPush), vec![]))
            .unwrap();
        assert_eq!(m.current(), &PartitionPhase::Sealed);
    }

    #[test]
    fn data_before_start_of_push_is_rejected() {
        let mut m = PhaseMachine::new();
        let err = m.apply(&entry(0, MessageType::Put, vec![])).unwrap_err();
        assert!(matches!(err, PhaseError::IllegalTransition { offset: 0, .. }));
    }

    #[test]
    fn nothing_follows_end_of_push() {
        let mut m = PhaseMachine::new();
        m.apply(&sop(0)).unwrap();
        m.apply(&entry(1, MessageType::Control(ControlType::EndOfPush), vec![]))
            .unwrap();

        assert!(m.apply(&entry(2, MessageType::Put, vec![])).is_err());
        assert!(m.apply(&sop(3)).is_err());
    }

    #[test]
    fn duplicate_start_of_push_is_rejected() {
        let mut m = PhaseMachine::new();
        m.apply(&sop(0)).unwrap();
        assert!(m.apply(&sop(1)).is_err());
    }
}
