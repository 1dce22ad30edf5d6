use super::{status_error, DataSourceAdapter, HostMetrics, QueryOutcome, WindowAggregateMetrics};
use crate::config::WindowSourceConfig;
use crate::error::{EngineError, Result};
use crate::task_manager::models::DataSourceKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const CPU_FIELD: &str = "system.cpu.total.norm.pct";
const MEMORY_USED_FIELD: &str = "system.memory.actual.used.bytes";
const DISK_USED_FIELD: &str = "system.fsstat.total_size.used";
const TIMESTAMP_FIELD: &str = "@timestamp";
const HOST_IP_FIELD: &str = "host.ip";

/// Reads per-host aggregates from a search index of time-series metric
/// documents.
pub struct WindowAggregateAdapter {
    client: reqwest::Client,
    source: WindowSourceConfig,
}

impl WindowAggregateAdapter {
    pub fn new(client: reqwest::Client, source: WindowSourceConfig) -> Self {
        Self { client, source }
    }

    fn search_url(&self) -> String {
        format!(
            "{}/{}/_search",
            self.source.endpoint.trim_end_matches('/'),
            self.source.index.trim_matches('/')
        )
    }
}

pub(crate) fn build_search_body(ip: &str, window: Duration) -> Value {
    let window_secs = window.as_secs().max(1);
    json!({
        "size": 1,
        "track_total_hits": true,
        "sort": [{ TIMESTAMP_FIELD: { "order": "desc" } }],
        "_source": ["host.name", "host.hostname"],
        "query": {
            "bool": {
                "filter": [
                    { "term": { HOST_IP_FIELD: ip } },
                    { "range": { TIMESTAMP_FIELD: { "gte": format!("now-{}s", window_secs) } } }
                ]
            }
        },
        "aggs": {
            "cpu_max": { "max": { "field": CPU_FIELD } },
            "cpu_avg": { "avg": { "field": CPU_FIELD } },
            "cpu_min": { "min": { "field": CPU_FIELD } },
            "memory_max": { "max": { "field": MEMORY_USED_FIELD } },
            "memory_avg": { "avg": { "field": MEMORY_USED_FIELD } },
            "disk_max": { "max": { "field": DISK_USED_FIELD } },
            "disk_avg": { "avg": { "field": DISK_USED_FIELD } }
        }
    })
}

/// Interprets a search response. Zero hits in the window is "no data", not an
/// error.
pub(crate) fn parse_search_response(body: &Value) -> Result<QueryOutcome> {
    let hits = body
        .get("hits")
        .ok_or_else(|| EngineError::AdapterTransient("Search response has no hits".to_string()))?;

    // Older clusters return a bare number, newer ones `{ "value": n }`.
    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(obj) => obj.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };
    if total == 0 {
        return Ok(QueryOutcome::NoData);
    }

    let host_name = hits
        .get("hits")
        .and_then(|h| h.get(0))
        .and_then(|h| h.get("_source"))
        .and_then(|s| s.get("host"))
        .and_then(|host| {
            host.get("name")
                .or_else(|| host.get("hostname"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);

    let aggs = body.get("aggregations");
    let agg = |name: &str| -> Option<f64> {
        aggs.and_then(|a| a.get(name))
            .and_then(|a| a.get("value"))
            .and_then(Value::as_f64)
    };
    let pct = |name: &str| agg(name).map(|fraction| round2(fraction * 100.0));

    Ok(QueryOutcome::Found(HostMetrics::WindowAggregate(
        WindowAggregateMetrics {
            host_name,
            cpu_max_percent: pct("cpu_max"),
            cpu_avg_percent: pct("cpu_avg"),
            cpu_min_percent: pct("cpu_min"),
            memory_used_max_bytes: agg("memory_max"),
            memory_used_avg_bytes: agg("memory_avg"),
            disk_used_max_bytes: agg("disk_max"),
            disk_used_avg_bytes: agg("disk_avg"),
            data_points: total,
        },
    )))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl DataSourceAdapter for WindowAggregateAdapter {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::WindowAggregate
    }

    async fn query_host_metrics(&self, ip: &str, window: Duration) -> Result<QueryOutcome> {
        let mut rb = self
            .client
            .post(self.search_url())
            .json(&build_search_body(ip, window));

        if let Some(username) = &self.source.username {
            rb = rb.basic_auth(username, self.source.password.as_deref());
        }

        let response = rb
            .send()
            .await
            .map_err(|e| EngineError::AdapterTransient(format!("Search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error("Search index", response).await);
        }

        let body: Value = response.json().await.map_err(|e| {
            EngineError::AdapterTransient(format!("Failed to decode search response: {}", e))
        })?;
        parse_search_response(&body)
    }
}

#[cfg(test)]
mod tests;
