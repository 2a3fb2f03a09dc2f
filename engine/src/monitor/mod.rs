//! Per-container monitor state machine and its tick source abstraction.

pub mod tick;
pub mod worker;

pub use tick::{CountedTickSource, IntervalTickSource, TickSource};
pub use worker::{MonitorWorker, Outcome};
