// Completion Policy
//
// How many replicas must seal a partition, which datacenters gate a
// version, and what happens when the completion deadline passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineAction {
    /// Every unconverged partition becomes ERROR.
    #[default]
    FailVersion,

    /// Drop required datacenters that stalled without errors, as long as
    /// another required datacenter converged.
    ExcludeStalledDatacenters,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("replica quorum {quorum} must be between 1 and the replication factor {replication_factor}")]
    InvalidQuorum { quorum: u32, replication_factor: u32 },

    #[error("at least one required datacenter must be configured")]
    NoRequiredDatacenters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    /// Replicas per partition in each datacenter.
    pub replication_factor: u32,

    /// Sealed replicas needed for a partition to complete.
    pub replica_quorum: u32,

    #[serde(with = "humantime_serde")]
    pub completion_timeout: Duration,

    pub required_datacenters: BTreeSet<String>,

    pub deadline_action: DeadlineAction,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl StatusPolicy {
    /// Default built-in policy (used if no config is provided).
    pub fn default_policy() -> Self {
        Self {
            replication_factor: 3,
            replica_quorum: 2,
            completion_timeout: Duration::from_secs(30 * 60),
            required_datacenters: BTreeSet::from(["dc-0".to_string()]),
            deadline_action: DeadlineAction::FailVersion,
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.replica_quorum == 0 || self.replica_quorum > self.replication_factor {
            return Err(PolicyError::InvalidQuorum {
                quorum: self.replica_quorum,
                replication_factor: self.replication_factor,
            });
        }
        if self.required_datacenters.is_empty() {
            return Err(PolicyError::NoRequiredDatacenters);
        }
        Ok(())
    }
}
