//! Parses pushed exposition-format text and submits it to the store.

use std::collections::BTreeMap;

use crate::domain::MetricFamily;
use crate::error::{GatewayError, Result};
use crate::store::{StoreHandle, WriteRequest};

/// Parses `text` as Prometheus exposition format and submits it under
/// `labels`, waiting for the store's acknowledgement.
///
/// `labels` must contain a `job` entry; otherwise this fails with
/// [`GatewayError::InvalidLabels`] without touching the store.
pub async fn push(
    store: &StoreHandle,
    text: &str,
    labels: BTreeMap<String, String>,
    timestamp: i64,
) -> Result<()> {
    if !labels.contains_key("job") {
        return Err(GatewayError::InvalidLabels);
    }

    let scrape = prometheus_parse::Scrape::parse(text.lines().map(|l| Ok(l.to_string())))
        .map_err(|e| GatewayError::ParseError(e.to_string()))?;
    let families = MetricFamily::from_scrape(scrape);

    store
        .submit_and_wait(WriteRequest {
            labels,
            timestamp,
            metric_families: Some(families),
            replace: false,
            done: None,
        })
        .await
}
