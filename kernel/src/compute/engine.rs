// Compute Engine
//
// Evaluates a request over a batch of keys on a bounded set of worker
// threads. The active version is snapshotted once per batch so every key
// reads the same version, whatever swap happens meanwhile. When the batch
// deadline passes or the caller cancels, the call returns at once with
// the keys done so far; the rest, including keys still being read, are
// reported unresolved. Workers own their inputs and are never joined, so
// a slow read cannot hold the caller past the deadline.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    ComputeError, ComputeRecord, ComputeRequest, ComputeResponse, KeyError, KeyResult,
    UnresolvedReason,
};
use crate::activation::{ActiveVersion, ServingView};
use crate::schema::codec::decode_record;
use crate::schema::SchemaRegistry;
use crate::storage::ReadResult;

const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Upper bound on threads evaluating one batch.
    pub workers: usize,

    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ComputeEngine {
    store: String,
    view: ServingView,
    schemas: Arc<SchemaRegistry>,
    config: ComputeConfig,
}

impl ComputeEngine {
    pub fn new(
        store: impl Into<String>,
        view: ServingView,
        schemas: Arc<SchemaRegistry>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            store: store.into(),
            view,
            schemas,
            config,
        }
    }

    pub fn compute(
        &self,
        keys: &[Vec<u8>],
        request: &ComputeRequest,
    ) -> Result<ComputeResponse, ComputeError> {
        self.compute_with_cancellation(keys, request, &AtomicBool::new(false))
    }

    /// Like [`compute`](Self::compute), stopping early once `cancel` is set.
    pub fn compute_with_cancellation(
        &self,
        keys: &[Vec<u8>],
        request: &ComputeRequest,
        cancel: &AtomicBool,
    ) -> Result<ComputeResponse, ComputeError> {
        request.validate()?;
        let active = self
            .view
            .current()
            .ok_or_else(|| ComputeError::NoActiveVersion(self.store.clone()))?;

        let deadline = Instant::now() + self.config.batch_timeout;
        let unique: BTreeSet<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let workers = self.config.workers.max(1).min(unique.len().max(1));

        let (key_tx, key_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        for key in &unique {
            let _ = key_tx.send(key.to_vec());
        }
        drop(key_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let request = Arc::new(request.clone());
        let mut started = 0;
        for i in 0..workers {
            let worker = Worker {
                keys: key_rx.clone(),
                results: result_tx.clone(),
                stop: Arc::clone(&stop),
                active: Arc::clone(&active),
                schemas: Arc::clone(&self.schemas),
                request: Arc::clone(&request),
            };
            match std::thread::Builder::new()
                .name(format!("compute-{i}"))
                .spawn(move || worker.run())
            {
                Ok(_) => started += 1,
                Err(e) => warn!(store = %active.store, e = %e, "cannot start compute worker"),
            }
        }
        drop(result_tx);
        if started == 0 {
            return Err(ComputeError::NoWorkers(self.store.clone()));
        }

        let mut results = BTreeMap::new();
        let mut stopped_by = None;
        loop {
            if cancel.load(Ordering::Relaxed) {
                stopped_by = Some(UnresolvedReason::Cancelled);
                break;
            }
            let wake = deadline.min(Instant::now() + CANCEL_POLL);
            match result_rx.recv_deadline(wake) {
                Ok((key, result)) => {
                    results.insert(key, result);
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    stopped_by = Some(UnresolvedReason::TimedOut);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        stop.store(true, Ordering::Relaxed);

        // Results already delivered when the batch stopped are kept.
        for (key, result) in result_rx.try_iter() {
            results.entry(key).or_insert(result);
        }

        if let Some(reason) = stopped_by {
            for key in &unique {
                results
                    .entry(key.to_vec())
                    .or_insert(KeyResult::Unresolved { reason });
            }
            warn!(
                store = %active.store,
                version = active.version,
                ?reason,
                keys = unique.len(),
                "compute batch stopped early"
            );
        }

        debug!(store = %active.store, version = active.version, keys = unique.len(), "compute batch done");
        Ok(ComputeResponse {
            store: active.store.clone(),
            version: active.version,
            results,
            timed_out: stopped_by == Some(UnresolvedReason::TimedOut),
            cancelled: stopped_by == Some(UnresolvedReason::Cancelled),
        })
    }
}

/// One detached compute thread. Stops at the stop flag or once the
/// collector went away.
struct Worker {
    keys: Receiver<Vec<u8>>,
    results: Sender<(Vec<u8>, KeyResult)>,
    stop: Arc<AtomicBool>,
    active: Arc<ActiveVersion>,
    schemas: Arc<SchemaRegistry>,
    request: Arc<ComputeRequest>,
}

impl Worker {
    fn run(self) {
        for key in self.keys.iter() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let result = self.compute_key(&key);
            if self.results.send((key, result)).is_err() {
                break;
            }
        }
    }

    fn compute_key(&self, key: &[u8]) -> KeyResult {
        let active = &self.active;
        let stored = match active.reader.read(key) {
            ReadResult::Found(stored) => stored,
            ReadResult::NotFound => return KeyResult::NotFound,
            ReadResult::NotYetVisible => return KeyResult::NotYetVisible,
        };

        let failed = |error| KeyResult::Failed { error };
        let Some(schema) = self.schemas.value_schema(&active.store, stored.schema_id) else {
            return failed(KeyError::UnknownSchema(stored.schema_id));
        };
        let bytes = match active.compressor.decompress(&stored.payload) {
            Ok(bytes) => bytes,
            Err(e) => return failed(KeyError::Decompression(e.to_string())),
        };
        match decode_record(&schema, &bytes) {
            Ok(record) => KeyResult::Computed(ComputeRecord::evaluate(
                &self.request,
                &schema,
                stored.schema_id,
                &record,
            )),
            Err(e) => failed(KeyError::Decode(e.to_string())),
        }
    }
}
