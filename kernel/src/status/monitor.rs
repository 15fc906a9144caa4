// Push Monitor
//
// Owns every version accumulator on one thread. Reports, tracking
// requests and snapshot queries arrive over a channel; status
// transitions are published to a subscriber channel. Deadlines are
// checked on every message and at a fixed tick.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    PolicyError, ProgressReport, ProgressReporter, StatusPolicy, StatusTransition,
    VersionAccumulator, VersionStatusSnapshot,
};
use crate::meta::VersionNumber;

const DEADLINE_TICK: Duration = Duration::from_millis(20);

#[derive(Debug)]
enum MonitorCommand {
    Track {
        store: String,
        version: VersionNumber,
        partition_count: u32,
    },
    Report(ProgressReport),
    Snapshot {
        store: String,
        version: VersionNumber,
        reply: Sender<Option<VersionStatusSnapshot>>,
    },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid status policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("failed to start monitor thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Cloneable sender side of a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    commands: Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Start aggregating a version. Reports that arrived earlier for it
    /// are replayed.
    pub fn track(&self, store: impl Into<String>, version: VersionNumber, partition_count: u32) {
        let _ = self.commands.send(MonitorCommand::Track {
            store: store.into(),
            version,
            partition_count,
        });
    }

    /// Current status of a tracked version, `None` if unknown or the
    /// monitor stopped.
    pub fn snapshot(&self, store: &str, version: VersionNumber) -> Option<VersionStatusSnapshot> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .send(MonitorCommand::Snapshot {
                store: store.to_string(),
                version,
                reply,
            })
            .ok()?;
        response.recv().ok().flatten()
    }
}

impl ProgressReporter for MonitorHandle {
    fn report(&self, report: ProgressReport) {
        let _ = self.commands.send(MonitorCommand::Report(report));
    }
}

pub struct PushMonitor {
    handle: MonitorHandle,
    worker: Option<JoinHandle<()>>,
}

impl PushMonitor {
    pub fn spawn(
        policy: StatusPolicy,
        transitions: Sender<StatusTransition>,
    ) -> Result<Self, MonitorError> {
        policy.validate()?;

        let (commands, inbox) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("push-monitor".into())
            .spawn(move || run(policy, inbox, transitions))?;

        Ok(Self {
            handle: MonitorHandle { commands },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Stop the monitor thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.commands.send(MonitorCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("push monitor thread panicked");
            }
        }
    }
}

impl Drop for PushMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(policy: StatusPolicy, inbox: Receiver<MonitorCommand>, transitions: Sender<StatusTransition>) {
    let mut versions: HashMap<(String, VersionNumber), VersionAccumulator> = HashMap::new();
    let mut untracked: HashMap<(String, VersionNumber), Vec<ProgressReport>> = HashMap::new();

    let publish = |transition: StatusTransition| {
        if transitions.send(transition).is_err() {
            debug!("no transition subscriber");
        }
    };

    loop {
        match inbox.recv_timeout(DEADLINE_TICK) {
            Ok(MonitorCommand::Track {
                store,
                version,
                partition_count,
            }) => {
                let key = (store.clone(), version);
                if versions.contains_key(&key) {
                    continue;
                }
                let mut acc = match VersionAccumulator::new(
                    store,
                    version,
                    partition_count,
                    policy.clone(),
                    Instant::now(),
                ) {
                    Ok(acc) => acc,
                    Err(e) => {
                        warn!(e=%e, "cannot track version");
                        continue;
                    }
                };
                info!(store = %key.0, version, partition_count, "tracking push status");

                for report in untracked.remove(&key).unwrap_or_default() {
                    if let Some(t) = acc.apply(&report).transition {
                        publish(t);
                    }
                }
                versions.insert(key, acc);
            }
            Ok(MonitorCommand::Report(report)) => {
                let key = (report.store.clone(), report.version);
                match versions.get_mut(&key) {
                    Some(acc) => {
                        if let Some(t) = acc.apply(&report).transition {
                            publish(t);
                        }
                    }
                    None => untracked.entry(key).or_default().push(report),
                }
            }
            Ok(MonitorCommand::Snapshot {
                store,
                version,
                reply,
            }) => {
                let snapshot = versions.get(&(store, version)).map(|acc| acc.snapshot());
                let _ = reply.send(snapshot);
            }
            Ok(MonitorCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        for acc in versions.values_mut() {
            if let Some(t) = acc.check_deadline(now) {
                publish(t);
            }
        }
    }
    debug!("push monitor stopped");
}
