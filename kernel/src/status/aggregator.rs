// Push Status Aggregator
//
// Folds asynchronous, possibly reordered or duplicated replica reports
// into one verdict per version.
//
// Per (partition, replica) the state only moves forward: offsets take the
// maximum, the sealed flag and the error code are sticky (the larger
// code wins when a replica reports two). A replica counts toward the
// quorum once it sealed, whatever it reports afterwards, so COMPLETED is
// a monotone function of the reports seen. Replica errors never end a
// partition on their own: a partition without quorum at the deadline
// fails, carrying the error codes its replicas reported. COMPLETED and
// ERROR never revert.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{info, warn};

use super::{
    AggregationTimeout, DeadlineAction, ErrorCode, ExecutionStatus, FailureReason,
    PartitionFailure, PolicyError, ProgressReport, StatusPolicy, StatusTransition,
};
use crate::log::Offset;
use crate::meta::{PartitionId, ReplicaId, VersionNumber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Applied,

    /// Nothing new: lower offset than already seen, or a duplicate.
    Stale,

    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    WrongVersion,
    UnknownPartition(PartitionId),

    /// More distinct replicas than the replication factor.
    TooManyReplicas,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub outcome: ReportOutcome,
    pub transition: Option<StatusTransition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ReplicaProgress {
    offset: Offset,
    sealed: bool,
    error: Option<ErrorCode>,
}

#[derive(Debug, Clone)]
struct PartitionAccumulator {
    replicas: BTreeMap<ReplicaId, ReplicaProgress>,
    status: ExecutionStatus,
}

impl PartitionAccumulator {
    fn new() -> Self {
        Self {
            replicas: BTreeMap::new(),
            status: ExecutionStatus::NotStarted,
        }
    }

    fn apply(&mut self, report: &ProgressReport, policy: &StatusPolicy) -> ReportOutcome {
        let is_new = !self.replicas.contains_key(&report.replica_id);
        if is_new && self.replicas.len() >= policy.replication_factor as usize {
            return ReportOutcome::Rejected(RejectReason::TooManyReplicas);
        }

        let progress = self.replicas.entry(report.replica_id.clone()).or_default();
        if report.offset < progress.offset {
            return ReportOutcome::Stale;
        }

        let joined = ReplicaProgress {
            offset: report.offset,
            sealed: progress.sealed || report.sealed,
            error: progress.error.clone().max(report.error.clone()),
        };
        if !is_new && joined == *progress {
            return ReportOutcome::Stale;
        }
        *progress = joined;

        self.recompute(policy);
        ReportOutcome::Applied
    }

    fn recompute(&mut self, policy: &StatusPolicy) {
        if self.status.is_terminal() {
            return;
        }

        let sealed = self.replicas.values().filter(|r| r.sealed).count() as u32;
        self.status = if sealed >= policy.replica_quorum {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Started
        };
    }

    fn failure_reason(&self) -> FailureReason {
        let errors = self.errors();
        if errors.is_empty() {
            FailureReason::Timeout
        } else {
            FailureReason::ReplicaErrors(errors)
        }
    }

    fn errors(&self) -> Vec<ErrorCode> {
        self.replicas
            .values()
            .filter_map(|r| r.error.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatacenterSnapshot {
    pub status: ExecutionStatus,
    pub required: bool,
    pub partitions: Vec<ExecutionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatusSnapshot {
    pub store: String,
    pub version: VersionNumber,
    pub status: ExecutionStatus,
    pub datacenters: BTreeMap<String, DatacenterSnapshot>,
    pub excluded_datacenters: BTreeSet<String>,
}

/// Status accumulator for one version across all datacenters.
#[derive(Debug)]
pub struct VersionAccumulator {
    store: String,
    version: VersionNumber,
    partition_count: u32,
    policy: StatusPolicy,
    deadline: Instant,
    datacenters: BTreeMap<String, Vec<PartitionAccumulator>>,
    status: ExecutionStatus,
    excluded: BTreeSet<String>,
}

impl VersionAccumulator {
    pub fn new(
        store: impl Into<String>,
        version: VersionNumber,
        partition_count: u32,
        policy: StatusPolicy,
        started_at: Instant,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;

        let datacenters = policy
            .required_datacenters
            .iter()
            .map(|dc| {
                (
                    dc.clone(),
                    vec![PartitionAccumulator::new(); partition_count as usize],
                )
            })
            .collect();

        Ok(Self {
            store: store.into(),
            version,
            partition_count,
            deadline: started_at + policy.completion_timeout,
            policy,
            datacenters,
            status: ExecutionStatus::NotStarted,
            excluded: BTreeSet::new(),
        })
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn version(&self) -> VersionNumber {
        self.version
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Fold one report in. Reports keep being recorded after the version
    /// turned terminal, but its status no longer changes.
    pub fn apply(&mut self, report: &ProgressReport) -> ApplyResult {
        let rejected = |reason| ApplyResult {
            outcome: ReportOutcome::Rejected(reason),
            transition: None,
        };
        if report.store != self.store || report.version != self.version {
            return rejected(RejectReason::WrongVersion);
        }
        if report.partition >= self.partition_count {
            return rejected(RejectReason::UnknownPartition(report.partition));
        }

        let partition_count = self.partition_count as usize;
        let partitions = self
            .datacenters
            .entry(report.datacenter.clone())
            .or_insert_with(|| vec![PartitionAccumulator::new(); partition_count]);
        let outcome = partitions[report.partition as usize].apply(report, &self.policy);

        let transition = match outcome {
            ReportOutcome::Applied => self.roll_up(),
            _ => None,
        };
        ApplyResult {
            outcome,
            transition,
        }
    }

    /// Apply the deadline action if the deadline passed before the
    /// version converged.
    pub fn check_deadline(&mut self, now: Instant) -> Option<StatusTransition> {
        if self.status.is_terminal() || now < self.deadline {
            return None;
        }

        let gating = self.gating_datacenters();
        let pending: Vec<(String, PartitionId)> = gating
            .iter()
            .flat_map(|dc| {
                self.datacenters[dc]
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.status != ExecutionStatus::Completed)
                    .map(move |(i, _)| (dc.clone(), i as PartitionId))
            })
            .collect();
        let timeout = AggregationTimeout {
            store: self.store.clone(),
            version: self.version,
            timeout: self.policy.completion_timeout,
            pending: pending.clone(),
        };

        if self.policy.deadline_action == DeadlineAction::ExcludeStalledDatacenters {
            let (converged, stalled): (Vec<_>, Vec<_>) = gating
                .into_iter()
                .partition(|dc| !pending.iter().any(|(p_dc, _)| p_dc == dc));
            if !converged.is_empty() && !stalled.is_empty() {
                warn!(
                    store = %self.store,
                    version = self.version,
                    excluded = ?stalled,
                    "completion deadline passed, excluding stalled datacenters"
                );
                self.excluded.extend(stalled);
                return self.transition_to(ExecutionStatus::Completed, Vec::new(), Some(timeout));
            }
        }

        warn!(
            store = %self.store,
            version = self.version,
            pending = pending.len(),
            "completion deadline passed, failing version"
        );
        let mut failing = Vec::with_capacity(pending.len());
        for (dc, partition) in pending {
            let Some(p) = self
                .datacenters
                .get_mut(&dc)
                .and_then(|ps| ps.get_mut(partition as usize))
            else {
                continue;
            };
            p.status = ExecutionStatus::Error;
            failing.push(PartitionFailure {
                datacenter: dc,
                partition,
                reason: p.failure_reason(),
            });
        }
        self.transition_to(ExecutionStatus::Error, failing, Some(timeout))
    }

    pub fn snapshot(&self) -> VersionStatusSnapshot {
        let datacenters = self
            .datacenters
            .iter()
            .map(|(dc, partitions)| {
                let statuses: Vec<_> = partitions.iter().map(|p| p.status).collect();
                (
                    dc.clone(),
                    DatacenterSnapshot {
                        status: rollup(&statuses),
                        required: self.policy.required_datacenters.contains(dc),
                        partitions: statuses,
                    },
                )
            })
            .collect();

        VersionStatusSnapshot {
            store: self.store.clone(),
            version: self.version,
            status: self.status,
            datacenters,
            excluded_datacenters: self.excluded.clone(),
        }
    }

    fn gating_datacenters(&self) -> Vec<String> {
        self.policy
            .required_datacenters
            .iter()
            .filter(|dc| !self.excluded.contains(*dc))
            .cloned()
            .collect()
    }

    fn roll_up(&mut self) -> Option<StatusTransition> {
        if self.status.is_terminal() {
            return None;
        }

        let all_completed = self.gating_datacenters().iter().all(|dc| {
            self.datacenters[dc]
                .iter()
                .all(|p| p.status == ExecutionStatus::Completed)
        });
        let any_progress = self
            .datacenters
            .values()
            .flatten()
            .any(|p| !p.replicas.is_empty());

        let next = if all_completed {
            ExecutionStatus::Completed
        } else if any_progress {
            ExecutionStatus::Started
        } else {
            ExecutionStatus::NotStarted
        };
        self.transition_to(next, Vec::new(), None)
    }

    fn transition_to(
        &mut self,
        next: ExecutionStatus,
        failing: Vec<PartitionFailure>,
        timeout: Option<AggregationTimeout>,
    ) -> Option<StatusTransition> {
        if next == self.status {
            return None;
        }
        let from = std::mem::replace(&mut self.status, next);
        info!(
            store = %self.store,
            version = self.version,
            ?from,
            to = ?next,
            failing = failing.len(),
            "push status changed"
        );

        Some(StatusTransition {
            store: self.store.clone(),
            version: self.version,
            from,
            to: next,
            failing,
            timeout,
            excluded_datacenters: self.excluded.clone(),
        })
    }
}

fn rollup(statuses: &[ExecutionStatus]) -> ExecutionStatus {
    if statuses.contains(&ExecutionStatus::Error) {
        ExecutionStatus::Error
    } else if statuses.iter().all(|s| *s == ExecutionStatus::Completed) {
        ExecutionStatus::Completed
    } else if statuses.iter().any(|s| *s != ExecutionStatus::NotStarted) {
        ExecutionStatus::Started
    } else {
        ExecutionStatus::NotStarted
    }
}
