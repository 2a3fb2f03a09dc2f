//! Serializable metric-family representation used by the store and persistence.
//!
//! [`crate::push`] parses pushed text into [`prometheus_parse::Scrape`] (the
//! "opaque" external value this crate is not responsible for); this module
//! converts that into a small `serde`-friendly shape grouped by family name,
//! the same way [`crate::cgroup`]'s counterpart in the reference daemon
//! defines its own persistence struct rather than serializing an upstream
//! wire type directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One labeled measurement within a [`MetricFamily`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// A named group of samples, as parsed from one exposition-format payload.
///
/// Within a [`crate::store::MetricGroup`], family names are unique; merging
/// two write requests replaces a family of the same name wholesale rather
/// than merging sample-by-sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub samples: Vec<MetricSample>,
}

impl MetricFamily {
    /// Groups a parsed scrape's flat sample list by metric name.
    pub fn from_scrape(scrape: prometheus_parse::Scrape) -> Vec<MetricFamily> {
        let mut by_name: BTreeMap<String, Vec<MetricSample>> = BTreeMap::new();
        for sample in scrape.samples {
            let value = match sample.value {
                prometheus_parse::Value::Counter(v) => v,
                prometheus_parse::Value::Gauge(v) => v,
                prometheus_parse::Value::Untyped(v) => v,
                prometheus_parse::Value::Histogram(_) | prometheus_parse::Value::Summary(_) => {
                    continue;
                }
            };
            let labels = sample
                .labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            by_name
                .entry(sample.metric)
                .or_default()
                .push(MetricSample { labels, value });
        }
        by_name
            .into_iter()
            .map(|(name, samples)| MetricFamily { name, samples })
            .collect()
    }

    /// Renders this family as exposition-format lines, with `overrides`
    /// (the owning group's labels) taking precedence over any label already
    /// present on a sample — callers (pushers) may not override group labels.
    pub fn render(&self, overrides: &BTreeMap<String, String>, out: &mut String) {
        use std::fmt::Write as _;

        for sample in &self.samples {
            let mut merged = sample.labels.clone();
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
            if merged.is_empty() {
                let _ = writeln!(out, "{} {}", self.name, sample.value);
            } else {
                let pairs: Vec<String> = merged
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                    .collect();
                let _ = writeln!(out, "{}{{{}}} {}", self.name, pairs.join(","), sample.value);
            }
        }
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
