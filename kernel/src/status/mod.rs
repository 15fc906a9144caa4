// Push Status
//
// Progress reports emitted by serving replicas and the per-version
// execution status derived from them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::log::Offset;
use crate::meta::{PartitionId, ReplicaId, VersionNumber};

pub mod aggregator;
pub mod monitor;
pub mod policy;

pub use aggregator::{ApplyResult, ReportOutcome, VersionAccumulator, VersionStatusSnapshot};
pub use monitor::{MonitorError, MonitorHandle, PushMonitor};
pub use policy::{DeadlineAction, PolicyError, StatusPolicy};

/// Aggregated status of a version, or of a partition within one
/// datacenter. COMPLETED and ERROR are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    NotStarted,
    Started,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Error)
    }
}

/// Unrecoverable ingestion failure reported by a replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub String);

/// Progress of one replica on one partition of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub store: String,
    pub version: VersionNumber,
    pub partition: PartitionId,
    pub replica_id: ReplicaId,
    pub datacenter: String,
    pub offset: Offset,
    pub sealed: bool,
    pub error: Option<ErrorCode>,
}

/// Why a partition ended in ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ReplicaErrors(Vec<ErrorCode>),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFailure {
    pub datacenter: String,
    pub partition: PartitionId,
    pub reason: FailureReason,
}

/// The completion deadline passed before the version converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("version {version} of `{store}` did not converge within {timeout:?}; {} partitions pending", .pending.len())]
pub struct AggregationTimeout {
    pub store: String,
    pub version: VersionNumber,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub pending: Vec<(String, PartitionId)>,
}

/// A change of a version's aggregated status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub store: String,
    pub version: VersionNumber,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,

    /// Partitions responsible for an ERROR transition.
    pub failing: Vec<PartitionFailure>,

    pub timeout: Option<AggregationTimeout>,

    /// Required datacenters dropped at the deadline.
    pub excluded_datacenters: BTreeSet<String>,
}

/// Sink for replica progress reports.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, report: ProgressReport);
}

impl ProgressReporter for Mutex<Vec<ProgressReport>> {
    fn report(&self, report: ProgressReport) {
        self.lock().push(report);
    }
}

impl ProgressReporter for crossbeam_channel::Sender<ProgressReport> {
    fn report(&self, report: ProgressReport) {
        // A closed channel means nobody is aggregating anymore.
        let _ = self.send(report);
    }
}
