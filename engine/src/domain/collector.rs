//! Pure derivation of labeled samples from a cgroup counter snapshot.

use crate::domain::counters::RawCounters;
use crate::domain::sample::Sample;
use crate::host_info::HostInfo;

const FIRST_TICK_TRUNCATION_NS: u64 = 500_000_000;

/// Per-worker state threaded through successive calls to [`collect_samples`].
///
/// This is an explicit record, not shared mutable state: a [`crate::monitor::worker::MonitorWorker`]
/// owns one instance and passes it by value into each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectorState {
    prev_time_ns: u64,
    prev_cpu_ns: u64,
    has_ticked: bool,
}

impl CollectorState {
    pub fn initial() -> Self {
        Self::default()
    }
}

/// Derives the reserved sample set from one counter snapshot.
///
/// `now_ns` is the caller-supplied wall-clock time of this tick, kept as an
/// explicit argument (rather than read internally) so the function stays a
/// pure function of `(prev_state, current_counters, host_info, now_ns)` and
/// is trivially testable without mocking the clock.
pub fn collect_samples(
    prev: CollectorState,
    counters: &RawCounters,
    host: &HostInfo,
    now_ns: u64,
) -> (Vec<Sample>, CollectorState) {
    let prev_time_ns = if prev.has_ticked {
        prev.prev_time_ns
    } else {
        now_ns - (now_ns % FIRST_TICK_TRUNCATION_NS)
    };

    let elapsed_ns = now_ns.saturating_sub(prev_time_ns);
    let cpu_delta_ns = counters.cpu_usage_ns.saturating_sub(prev.prev_cpu_ns);
    let cpu_usage = if elapsed_ns == 0 {
        0.0
    } else {
        (cpu_delta_ns as f64 / elapsed_ns as f64) * 100.0
    };

    let memory_usage = percentage(
        counters.memory_current,
        effective_limit(counters.memory_limit, host.total_memory_bytes),
    );
    let memory_swap_usage = percentage(
        counters.swap_current,
        effective_limit(counters.swap_limit, host.total_swap_bytes),
    );
    let pid_usage = percentage(counters.pids_current as u64, counters.pids_limit);

    let samples = vec![
        Sample::new("cpu_usage", cpu_usage),
        Sample::new("memory_usage", memory_usage),
        Sample::new("memory_swap_usage", memory_swap_usage),
        Sample::new("memory_kernel_usage", counters.kernel_memory as f64),
        Sample::new("pid_usage", pid_usage),
    ];

    let next = CollectorState {
        prev_time_ns: now_ns,
        prev_cpu_ns: counters.cpu_usage_ns,
        has_ticked: true,
    };

    (samples, next)
}

fn effective_limit(limit: u64, host_total: u64) -> u64 {
    if limit == u64::MAX {
        host_total
    } else {
        limit
    }
}

fn percentage(current: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        (current as f64 / limit as f64) * 100.0
    }
}
