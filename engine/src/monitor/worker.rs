//! Per-container monitor state machine: NEW -> ATTACHING -> RUNNING -> (COMPLETED | FAILED).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::cgroup::CGroupPort;
use crate::domain::{collect_samples, CollectorState, ContainerDescriptor};
use crate::error::{GatewayError, Result};
use crate::host_info::HostInfo;
use crate::monitor::tick::TickSource;
use crate::push;
use crate::store::StoreHandle;

/// The worker's single, terminal outcome.
#[derive(Debug)]
pub enum Outcome {
    Completed(ContainerDescriptor),
    Failed(ContainerDescriptor, GatewayError),
}

/// Drives one container's cgroup lifecycle: creates the cgroup, attaches the
/// peer PID, samples on every tick, and tears everything down exactly once
/// on exit. Independent of every other worker — a failure here never
/// propagates beyond this worker's own outcome.
pub struct MonitorWorker<C: CGroupPort, T: TickSource> {
    descriptor: ContainerDescriptor,
    cgroup: Arc<C>,
    tick_source: T,
    store: StoreHandle,
    host: HostInfo,
}

impl<C: CGroupPort, T: TickSource> MonitorWorker<C, T> {
    pub fn new(
        descriptor: ContainerDescriptor,
        cgroup: Arc<C>,
        tick_source: T,
        store: StoreHandle,
        host: HostInfo,
    ) -> Self {
        Self {
            descriptor,
            cgroup,
            tick_source,
            store,
            host,
        }
    }

    /// Runs the full state machine to completion, returning exactly one
    /// [`Outcome`]. Never panics on a worker-local error; every failure path
    /// is captured as `Outcome::Failed`.
    pub async fn run(mut self) -> Outcome {
        if let Err(e) = self.cgroup.create(&self.descriptor.id).await {
            error!(id = %self.descriptor.id, error = %e, "failed to create cgroup");
            return Outcome::Failed(self.descriptor, e);
        }

        if let Err(e) = self.cgroup.attach(self.descriptor.pid).await {
            error!(id = %self.descriptor.id, error = %e, "failed to attach pid to cgroup");
            let _ = self.cgroup.destroy().await;
            return Outcome::Failed(self.descriptor, e);
        }

        info!(id = %self.descriptor.id, pid = self.descriptor.pid, "monitor worker attached, running");

        let mut collector_state = CollectorState::initial();
        loop {
            let now_ns = self.tick_source.tick().await;

            match self.cgroup.has_process().await {
                Ok(false) => {
                    let tombstone_labels = job_labels(&self.descriptor.id);
                    self.store.submit(crate::store::WriteRequest {
                        labels: tombstone_labels,
                        timestamp: (now_ns / 1_000_000) as i64,
                        metric_families: None,
                        replace: false,
                        done: None,
                    });
                    info!(id = %self.descriptor.id, "cgroup empty, completing");
                    let _ = self.cgroup.destroy().await;
                    return Outcome::Completed(self.descriptor);
                }
                Ok(true) => {
                    if let Err(e) = self.tick(now_ns, &mut collector_state).await {
                        error!(id = %self.descriptor.id, error = %e, "tick failed, terminating worker");
                        let _ = self.cgroup.destroy().await;
                        return Outcome::Failed(self.descriptor, e);
                    }
                }
                Err(e) => {
                    error!(id = %self.descriptor.id, error = %e, "failed to query cgroup membership");
                    let _ = self.cgroup.destroy().await;
                    return Outcome::Failed(self.descriptor, e);
                }
            }
        }
    }

    async fn tick(&self, now_ns: u64, collector_state: &mut CollectorState) -> Result<()> {
        let counters = self.cgroup.read_counters().await?;
        let (samples, next_state) =
            collect_samples(*collector_state, &counters, &self.host, now_ns);
        *collector_state = next_state;

        let mut text = String::new();
        for sample in &samples {
            text.push_str(&format!("{} {}\n", sample.name, sample.value));
        }

        push::push(
            &self.store,
            &text,
            job_labels(&self.descriptor.id),
            (now_ns / 1_000_000) as i64,
        )
        .await
    }
}

fn job_labels(id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("job".to_string(), id.to_string());
    labels
}
