//! In-memory, job-keyed metric store, modeled as a message-passing actor.
//!
//! Mirrors the "store as a goroutine-owned actor" pattern this crate was
//! asked to recast: an owning task loops over an `mpsc::Receiver`, and
//! [`StoreHandle`]'s methods are thin wrappers that send a command (a
//! `oneshot` reply channel for the request/response ones). No `Mutex`
//! guards any store state — everything routes through the single
//! serializer task.

pub mod persistence;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::domain::MetricFamily;
use crate::error::{GatewayError, Result};

const LABEL_KEY_DELIMITER: char = '\u{1}'; // not a legal character in a label name or value

/// A single write submitted by a [`crate::monitor::MonitorWorker`] or
/// [`crate::push`].
#[derive(Debug)]
pub struct WriteRequest {
    pub labels: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch. Millisecond (not second)
    /// precision keeps successive ticks from a sub-second
    /// `--monitor.interval` strictly ordered.
    pub timestamp: i64,
    /// `None` means "delete all series under these labels" (a tombstone).
    pub metric_families: Option<Vec<MetricFamily>>,
    pub replace: bool,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

/// The store's unit of aggregation: labels, the timestamp of the most
/// recent write, and the metric families currently associated with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub labels: BTreeMap<String, String>,
    pub timestamp: i64,
    pub families: Vec<MetricFamily>,
}

/// A flattened, point-in-time view across every group in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub groups: Vec<MetricGroup>,
}

impl StoreSnapshot {
    /// Renders every group as exposition-format text, with each group's
    /// labels taking precedence over any label already on a sample.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for group in &self.groups {
            for family in &group.families {
                family.render(&group.labels, &mut out);
            }
        }
        out
    }
}

/// The sorted `name=value` join used to key groups by label set. Equal iff
/// the label sets are equal as mappings (order-independent, since the
/// backing map is already sorted by key).
pub fn canonical_key(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(&LABEL_KEY_DELIMITER.to_string())
}

enum Command {
    Submit(WriteRequest),
    Gather(oneshot::Sender<StoreSnapshot>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// A cheaply-cloneable handle to the store's serializer task.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
}

impl StoreHandle {
    /// Non-blocking enqueue; the loop applies the write asynchronously.
    /// Silently drops the request if the store has already shut down
    /// (mirrors an `mpsc` send into a closed channel never panicking here).
    pub fn submit(&self, request: WriteRequest) {
        if self.tx.try_send(Command::Submit(request)).is_err() {
            warn!("metric store is shut down; dropping write request");
        }
    }

    /// Submits `request` and waits for its acknowledgement.
    pub async fn submit_and_wait(&self, mut request: WriteRequest) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        request.done = Some(done_tx);
        self.tx
            .send(Command::Submit(request))
            .await
            .map_err(|_| GatewayError::ServerError("metric store is shut down".to_string()))?;
        done_rx
            .await
            .map_err(|_| GatewayError::ServerError("metric store dropped acknowledgement".to_string()))?
    }

    pub async fn gather(&self) -> StoreSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Gather(tx)).await.is_err() {
            return StoreSnapshot { groups: Vec::new() };
        }
        rx.await.unwrap_or(StoreSnapshot { groups: Vec::new() })
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).await.is_err() {
            return Ok(());
        }
        rx.await
            .unwrap_or_else(|_| Err(GatewayError::ServerError("store task already gone".to_string())))
    }
}

/// Configuration for optional disk persistence.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub file: PathBuf,
    pub min_interval: Duration,
}

struct StoreState {
    groups: BTreeMap<String, MetricGroup>,
    persistence: Option<PersistenceConfig>,
    dirty: bool,
    last_flush: Option<tokio::time::Instant>,
}

impl StoreState {
    fn apply(&mut self, request: WriteRequest) -> Result<()> {
        let key = canonical_key(&request.labels);
        match request.metric_families {
            None => {
                self.groups.remove(&key);
            }
            Some(families) => {
                if request.replace {
                    self.groups.insert(
                        key,
                        MetricGroup {
                            labels: request.labels,
                            timestamp: request.timestamp,
                            families,
                        },
                    );
                } else {
                    let entry = self.groups.entry(key).or_insert_with(|| MetricGroup {
                        labels: request.labels.clone(),
                        timestamp: request.timestamp,
                        families: Vec::new(),
                    });
                    entry.timestamp = request.timestamp;
                    for family in families {
                        if let Some(existing) =
                            entry.families.iter_mut().find(|f| f.name == family.name)
                        {
                            *existing = family;
                        } else {
                            entry.families.push(family);
                        }
                    }
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            groups: self.groups.values().cloned().collect(),
        }
    }

    fn flush(&mut self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let groups: Vec<MetricGroup> = self.groups.values().cloned().collect();
        persistence::save(&persistence.file, &groups)?;
        self.dirty = false;
        self.last_flush = Some(tokio::time::Instant::now());
        Ok(())
    }

    fn due_for_flush(&self) -> bool {
        let Some(persistence) = &self.persistence else {
            return false;
        };
        if !self.dirty {
            return false;
        }
        match self.last_flush {
            None => true,
            Some(last) => last.elapsed() >= persistence.min_interval,
        }
    }
}

/// Starts the store's serializer task and returns a handle to it.
///
/// If `persistence` is set, the file is loaded synchronously before the
/// task starts, seeding the in-memory groups.
pub fn spawn(persistence: Option<PersistenceConfig>) -> Result<StoreHandle> {
    let mut groups = BTreeMap::new();
    if let Some(config) = &persistence {
        for group in persistence::load(&config.file)? {
            groups.insert(canonical_key(&group.labels), group);
        }
        info!(file = %config.file.display(), count = groups.len(), "loaded persisted metric groups");
    }

    let (tx, mut rx) = mpsc::channel(256);
    let mut state = StoreState {
        groups,
        persistence,
        dirty: false,
        last_flush: None,
    };

    tokio::spawn(async move {
        let mut flush_tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                maybe_cmd = rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    match cmd {
                        Command::Submit(mut request) => {
                            let done = request.done.take();
                            let result = state.apply(request);
                            if let Some(done) = done {
                                let _ = done.send(result);
                            }
                        }
                        Command::Gather(reply) => {
                            let _ = reply.send(state.snapshot());
                        }
                        Command::Shutdown(reply) => {
                            let result = state.flush();
                            if let Err(e) = &result {
                                error!(error = %e, "final persistence flush failed during shutdown");
                            }
                            let _ = reply.send(result);
                            break;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    if state.due_for_flush() {
                        if let Err(e) = state.flush() {
                            error!(error = %e, "periodic persistence flush failed");
                        } else {
                            debug!("periodic persistence flush completed");
                        }
                    }
                }
            }
        }
    });

    Ok(StoreHandle { tx })
}
