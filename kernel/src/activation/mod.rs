// Version Activation Coordinator
//
// Sole mutation path of a store's current-version pointer. Swaps are
// serialized per store through a `StoreLock` and checked against the
// expected current version. Readers see the active version only through
// a `ServingView`, one atomic pointer per store.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::compression::Compressor;
use crate::meta::{MetadataError, MetadataStore, Store, VersionNumber, VersionStatus};
use crate::status::{ExecutionStatus, StatusTransition};
use crate::storage::ValueReader;

pub mod lock;

pub use lock::{InMemoryStoreLock, LockError, StoreLease, StoreLock};

const SWEEP_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// How long the displaced version stays available for rollback.
    #[serde(with = "humantime_serde")]
    pub rollback_grace_period: Duration,

    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            rollback_grace_period: Duration::from_secs(24 * 60 * 60),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("current version of `{store}` is {actual:?}, expected {expected:?}")]
    Conflict {
        store: String,
        expected: Option<VersionNumber>,
        actual: Option<VersionNumber>,
    },

    #[error("version {version} of `{store}` is {status:?}, not completed")]
    NotCompleted {
        store: String,
        version: VersionNumber,
        status: VersionStatus,
    },

    #[error("unknown version {version} of `{store}`")]
    UnknownVersion {
        store: String,
        version: VersionNumber,
    },

    #[error("no serving replica holds version {version} of `{store}`")]
    NotServed {
        store: String,
        version: VersionNumber,
    },

    #[error("no version of `{0}` is available for rollback")]
    RollbackUnavailable(String),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

/// A version as served to readers.
pub struct ActiveVersion {
    pub store: String,
    pub version: VersionNumber,
    pub compressor: Compressor,
    pub reader: Arc<dyn ValueReader>,
}

impl fmt::Debug for ActiveVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveVersion")
            .field("store", &self.store)
            .field("version", &self.version)
            .field("compression", &self.compressor.strategy())
            .finish_non_exhaustive()
    }
}

/// Read-only handle on a store's active version.
#[derive(Debug, Clone, Default)]
pub struct ServingView {
    slot: Arc<RwLock<Option<Arc<ActiveVersion>>>>,
}

impl ServingView {
    /// Snapshot of the active version. Holding the snapshot keeps that
    /// version readable even if a swap happens meanwhile.
    pub fn current(&self) -> Option<Arc<ActiveVersion>> {
        self.slot.read().clone()
    }

    /// View fixed on one version, for readers without a coordinator.
    pub fn pinned(active: ActiveVersion) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(Arc::new(active)))),
        }
    }

    fn swap(&self, next: Arc<ActiveVersion>) -> Option<Arc<ActiveVersion>> {
        self.slot.write().replace(next)
    }
}

/// Locates the data of a completed version on the serving tier.
pub trait ServingResolver: Send + Sync {
    fn resolve(&self, store: &str, version: VersionNumber) -> Option<Arc<dyn ValueReader>>;
}

/// Receives versions whose rollback grace period ended.
pub trait VersionRetirement: Send + Sync {
    fn retire(&self, store: &str, version: VersionNumber);
}

impl VersionRetirement for Mutex<Vec<(String, VersionNumber)>> {
    fn retire(&self, store: &str, version: VersionNumber) {
        self.lock().push((store.to_string(), version));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    Activated {
        store: String,
        version: VersionNumber,
        previous: Option<VersionNumber>,
    },
    MarkedError {
        store: String,
        version: VersionNumber,
    },

    /// Completed after a newer version was already current; left
    /// inactive.
    Superseded {
        store: String,
        version: VersionNumber,
        current: VersionNumber,
    },
    RolledBack {
        store: String,
        from: VersionNumber,
        to: VersionNumber,
    },
}

struct RetainedVersion {
    active: Arc<ActiveVersion>,
    until: Instant,
}

pub struct ActivationCoordinator {
    metadata: Arc<dyn MetadataStore>,
    lock: Arc<dyn StoreLock>,
    resolver: Arc<dyn ServingResolver>,
    retirement: Arc<dyn VersionRetirement>,
    config: ActivationConfig,
    views: RwLock<HashMap<String, ServingView>>,
    retained: Mutex<HashMap<String, RetainedVersion>>,
}

impl ActivationCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        lock: Arc<dyn StoreLock>,
        resolver: Arc<dyn ServingResolver>,
        retirement: Arc<dyn VersionRetirement>,
        config: ActivationConfig,
    ) -> Self {
        Self {
            metadata,
            lock,
            resolver,
            retirement,
            config,
            views: RwLock::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        }
    }

    /// Reader capability for a store. Empty until a version is activated.
    pub fn serving_view(&self, store: &str) -> ServingView {
        if let Some(view) = self.views.read().get(store) {
            return view.clone();
        }
        self.views
            .write()
            .entry(store.to_string())
            .or_default()
            .clone()
    }

    /// Version kept for rollback, if any.
    pub fn backup_version(&self, store: &str) -> Option<VersionNumber> {
        self.retained.lock().get(store).map(|r| r.active.version)
    }

    /// React to an aggregated status change.
    pub fn handle_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<Option<ActivationOutcome>, ActivationError> {
        let store = &transition.store;
        let version = transition.version;

        match transition.to {
            ExecutionStatus::Completed => {
                self.metadata
                    .set_version_status(store, version, VersionStatus::Completed)?;
                let expected = self.metadata.get_store(store)?.current_version;
                self.activate(store, version, expected).map(Some)
            }
            ExecutionStatus::Error => {
                warn!(
                    store = %store,
                    version,
                    failing = transition.failing.len(),
                    timed_out = transition.timeout.is_some(),
                    "push failed, version marked as error"
                );
                self.metadata
                    .set_version_status(store, version, VersionStatus::Error)?;
                Ok(Some(ActivationOutcome::MarkedError {
                    store: store.clone(),
                    version,
                }))
            }
            ExecutionStatus::NotStarted | ExecutionStatus::Started => Ok(None),
        }
    }

    /// Make `version` current if the store's current version is still
    /// `expected`.
    pub fn activate(
        &self,
        store: &str,
        version: VersionNumber,
        expected: Option<VersionNumber>,
    ) -> Result<ActivationOutcome, ActivationError> {
        let _lease = StoreLease::acquire(self.lock.as_ref(), store, self.config.lock_timeout)?;

        let meta = self.metadata.get_store(store)?;
        if meta.current_version != expected {
            return Err(ActivationError::Conflict {
                store: store.to_string(),
                expected,
                actual: meta.current_version,
            });
        }
        if let Some(current) = meta.current_version.filter(|current| version <= *current) {
            info!(store, version, current, "version superseded by the current one");
            if version < current {
                self.retirement.retire(store, version);
            }
            return Ok(ActivationOutcome::Superseded {
                store: store.to_string(),
                version,
                current,
            });
        }
        let target = meta
            .version(version)
            .ok_or_else(|| ActivationError::UnknownVersion {
                store: store.to_string(),
                version,
            })?;
        if target.status != VersionStatus::Completed {
            return Err(ActivationError::NotCompleted {
                store: store.to_string(),
                version,
                status: target.status,
            });
        }
        let reader = self
            .resolver
            .resolve(store, version)
            .ok_or_else(|| ActivationError::NotServed {
                store: store.to_string(),
                version,
            })?;
        let active = Arc::new(ActiveVersion {
            store: store.to_string(),
            version,
            compressor: Compressor::new(target.compression, target.dictionary.as_deref()),
            reader,
        });

        check_status_change(&meta, version, VersionStatus::Online)?;
        if let Some(previous) = expected {
            check_status_change(&meta, previous, VersionStatus::Retired)?;
        }

        self.compare_and_set(store, expected, version)?;
        self.metadata
            .set_version_status(store, version, VersionStatus::Online)?;
        if let Some(previous) = expected {
            self.metadata
                .set_version_status(store, previous, VersionStatus::Retired)?;
        }

        let displaced = self.serving_view(store).swap(active);
        if let Some(displaced) = displaced {
            let replaced = self.retained.lock().insert(
                store.to_string(),
                RetainedVersion {
                    active: displaced,
                    until: Instant::now() + self.config.rollback_grace_period,
                },
            );
            // Only one backup is kept per store.
            if let Some(older) = replaced {
                self.retirement.retire(store, older.active.version);
            }
        }

        info!(store, version, previous = ?expected, "version activated");
        Ok(ActivationOutcome::Activated {
            store: store.to_string(),
            version,
            previous: expected,
        })
    }

    /// Swap back to the retained previous version. The version rolled
    /// back from is marked as error.
    pub fn rollback(&self, store: &str) -> Result<ActivationOutcome, ActivationError> {
        let _lease = StoreLease::acquire(self.lock.as_ref(), store, self.config.lock_timeout)?;

        let backup = self
            .retained
            .lock()
            .get(store)
            .filter(|r| r.until > Instant::now())
            .map(|r| Arc::clone(&r.active))
            .ok_or_else(|| ActivationError::RollbackUnavailable(store.to_string()))?;

        let meta = self.metadata.get_store(store)?;
        let current = meta.current_version;
        let Some(from) = current else {
            return Err(ActivationError::RollbackUnavailable(store.to_string()));
        };
        let to = backup.version;
        check_status_change(&meta, to, VersionStatus::Online)?;
        check_status_change(&meta, from, VersionStatus::Error)?;

        self.compare_and_set(store, current, to)?;
        self.retained.lock().remove(store);
        self.metadata
            .set_version_status(store, to, VersionStatus::Online)?;
        self.metadata
            .set_version_status(store, from, VersionStatus::Error)?;
        self.serving_view(store).swap(backup);
        self.retirement.retire(store, from);

        warn!(store, from, to, "rolled back to previous version");
        Ok(ActivationOutcome::RolledBack {
            store: store.to_string(),
            from,
            to,
        })
    }

    /// Hand versions whose grace period ended at `now` to retirement.
    pub fn sweep_retired(&self, now: Instant) -> Vec<(String, VersionNumber)> {
        let expired: Vec<(String, VersionNumber)> = {
            let mut retained = self.retained.lock();
            let stores: Vec<String> = retained
                .iter()
                .filter(|(_, r)| r.until <= now)
                .map(|(store, _)| store.clone())
                .collect();
            stores
                .into_iter()
                .filter_map(|store| {
                    retained
                        .remove(&store)
                        .map(|r| (store, r.active.version))
                })
                .collect()
        };

        for (store, version) in &expired {
            info!(store = %store, version, "rollback grace period over");
            self.retirement.retire(store, *version);
        }
        expired
    }

    /// Consume status transitions until the channel closes.
    pub fn run(&self, transitions: Receiver<StatusTransition>) {
        loop {
            match transitions.recv_timeout(SWEEP_TICK) {
                Ok(transition) => {
                    if let Err(e) = self.handle_transition(&transition) {
                        warn!(
                            store = %transition.store,
                            version = transition.version,
                            e=%e,
                            "activation failed"
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.sweep_retired(Instant::now());
        }
    }

    fn compare_and_set(
        &self,
        store: &str,
        expected: Option<VersionNumber>,
        next: VersionNumber,
    ) -> Result<(), ActivationError> {
        self.metadata
            .compare_and_set_current_version(store, expected, next)
            .map_err(|e| match e {
                MetadataError::CurrentVersionMismatch {
                    store,
                    expected,
                    actual,
                } => ActivationError::Conflict {
                    store,
                    expected,
                    actual,
                },
                other => ActivationError::Metadata(other),
            })
    }
}

/// Fail before any mutation when `version` cannot move to `next`.
fn check_status_change(
    meta: &Store,
    version: VersionNumber,
    next: VersionStatus,
) -> Result<(), ActivationError> {
    let current = meta
        .version(version)
        .ok_or_else(|| ActivationError::UnknownVersion {
            store: meta.name.clone(),
            version,
        })?
        .status;
    if current == next || current.can_transition_to(next) {
        Ok(())
    } else {
        Err(MetadataError::IllegalStatusTransition {
            store: meta.name.clone(),
            version,
            from: current,
            to: next,
        }
        .into())
    }
}
