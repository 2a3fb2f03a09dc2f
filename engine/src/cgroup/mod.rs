//! Cgroup lifecycle: creation, attachment, membership, and counter reads.

pub mod linux;

use crate::domain::counters::RawCounters;
use crate::error::Result;
use async_trait::async_trait;

/// One cgroup under the gateway's fixed parent path.
///
/// At most one handle exists per path at a time; `attach` must precede any
/// counter read for that PID to count, and `destroy` must be safe to call
/// exactly once (a second call is a programmer error, not a recoverable
/// condition).
#[async_trait]
pub trait CGroupPort: Send + Sync {
    async fn create(&self, id: &str) -> Result<()>;
    async fn attach(&self, pid: u32) -> Result<()>;
    async fn has_process(&self) -> Result<bool>;
    async fn read_counters(&self) -> Result<RawCounters>;
    async fn destroy(&self) -> Result<()>;
}
