//! Pluggable tick source driving a [`crate::monitor::MonitorWorker`]'s loop.

use async_trait::async_trait;
use std::time::Duration;

/// A source of tick events. Production code drives workers with
/// [`IntervalTickSource`]; tests substitute a fake that resolves immediately
/// so a worker's state machine can be exercised deterministically without
/// waiting on real wall-clock time.
#[async_trait]
pub trait TickSource: Send {
    async fn tick(&mut self) -> u64;
}

/// Wraps a `tokio::time::Interval`, returning the current wall-clock time in
/// nanoseconds on every tick.
pub struct IntervalTickSource {
    interval: tokio::time::Interval,
}

impl IntervalTickSource {
    pub fn new(period: Duration) -> Self {
        Self {
            interval: tokio::time::interval(period),
        }
    }
}

#[async_trait]
impl TickSource for IntervalTickSource {
    async fn tick(&mut self) -> u64 {
        self.interval.tick().await;
        now_ns()
    }
}

/// A tick source that resolves immediately, `count` times, then never again
/// (for tests that need a worker to observe an exact number of ticks).
pub struct CountedTickSource {
    remaining: usize,
    step_ns: u64,
    current_ns: u64,
}

impl CountedTickSource {
    pub fn new(count: usize, start_ns: u64, step_ns: u64) -> Self {
        Self {
            remaining: count,
            step_ns,
            current_ns: start_ns,
        }
    }
}

#[async_trait]
impl TickSource for CountedTickSource {
    async fn tick(&mut self) -> u64 {
        if self.remaining == 0 {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves");
        }
        self.remaining -= 1;
        self.current_ns += self.step_ns;
        self.current_ns
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
