//! Core data model and pure sampling logic.

pub mod collector;
pub mod counters;
pub mod descriptor;
pub mod metric_family;
pub mod sample;

pub use collector::{collect_samples, CollectorState};
pub use counters::RawCounters;
pub use descriptor::ContainerDescriptor;
pub use metric_family::{MetricFamily, MetricSample};
pub use sample::Sample;
