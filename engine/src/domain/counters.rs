//! Raw accounting values read from one cgroup, before derived metrics.

/// A cgroup's kernel-reported accounting values, read atomically in one pass.
///
/// `memory_limit`, `swap_limit`, and `pids_limit` use [`u64::MAX`] as the
/// "no limit" sentinel — cgroup v2 represents this as the literal string
/// `max` in `memory.max` / `memory.swap.max` / `pids.max`; [`crate::cgroup`]
/// maps that string to this sentinel so the rest of the pipeline only ever
/// reasons about one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCounters {
    pub cpu_usage_ns: u64,
    pub memory_current: u64,
    pub memory_limit: u64,
    pub swap_current: u64,
    pub swap_limit: u64,
    pub kernel_memory: u64,
    pub pids_current: u32,
    pub pids_limit: u64,
}
