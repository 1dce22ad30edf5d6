//! External metric providers the sync pipeline reconciles from.
//!
//! Two variants exist and they report different physical quantities: the
//! window-aggregate source yields CPU percentages plus absolute memory/disk
//! usage over a look-back window, the snapshot source yields current
//! percentages. [`HostMetrics::to_upsert`] keeps the two pipelines apart so
//! neither overwrites the other's quantities with a unit it does not own.

pub mod snapshot;
pub mod window;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::task_manager::models::{DataSourceKind, MetricsUpsert, SyncTask};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use snapshot::SnapshotAdapter;
pub use window::WindowAggregateAdapter;

/// Aggregates over the query window, as reported by the search index.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowAggregateMetrics {
    pub host_name: Option<String>,
    pub cpu_max_percent: Option<f64>,
    pub cpu_avg_percent: Option<f64>,
    pub cpu_min_percent: Option<f64>,
    pub memory_used_max_bytes: Option<f64>,
    pub memory_used_avg_bytes: Option<f64>,
    pub disk_used_max_bytes: Option<f64>,
    pub disk_used_avg_bytes: Option<f64>,
    pub data_points: u64,
}

/// Current utilisation percentages, as reported by the inventory API.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetrics {
    pub host_name: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum HostMetrics {
    WindowAggregate(WindowAggregateMetrics),
    Snapshot(SnapshotMetrics),
}

impl HostMetrics {
    pub fn host_name(&self) -> Option<&str> {
        let name = match self {
            Self::WindowAggregate(m) => m.host_name.as_deref(),
            Self::Snapshot(m) => m.host_name.as_deref(),
        };
        name.map(str::trim).filter(|n| !n.is_empty())
    }

    pub fn to_upsert(&self) -> MetricsUpsert {
        match self {
            Self::WindowAggregate(m) => MetricsUpsert {
                source: DataSourceKind::WindowAggregate,
                cpu_percent: m.cpu_max_percent,
                cpu_avg_percent: m.cpu_avg_percent,
                cpu_min_percent: m.cpu_min_percent,
                memory_used_bytes: m.memory_used_max_bytes,
                memory_used_avg_bytes: m.memory_used_avg_bytes,
                disk_used_bytes: m.disk_used_max_bytes,
                disk_used_avg_bytes: m.disk_used_avg_bytes,
                data_points: Some(m.data_points),
                ..Default::default()
            },
            Self::Snapshot(m) => MetricsUpsert {
                source: DataSourceKind::Snapshot,
                cpu_percent: m.cpu_percent,
                memory_percent: m.memory_percent,
                disk_percent: m.disk_percent,
                ..Default::default()
            },
        }
    }

    /// JSON copy stored on the run detail row.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Found(HostMetrics),
    /// The source answered but holds nothing for this host.
    NoData,
}

#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    fn kind(&self) -> DataSourceKind;

    async fn query_host_metrics(&self, ip: &str, window: Duration) -> Result<QueryOutcome>;

    /// Largest IP list one [`DataSourceAdapter::query_batch`] call should
    /// carry, for sources with a real batch API. `None` means the sync
    /// pipeline queries host by host.
    fn batch_size(&self) -> Option<usize> {
        None
    }

    /// Queries several hosts at once. Sources without a batch API fall back to
    /// one call per host; the first transport error aborts the batch.
    async fn query_batch(
        &self,
        ips: &[String],
        window: Duration,
    ) -> Result<HashMap<String, QueryOutcome>> {
        let mut out = HashMap::with_capacity(ips.len());
        for ip in ips {
            let outcome = self.query_host_metrics(ip, window).await?;
            out.insert(ip.clone(), outcome);
        }
        Ok(out)
    }
}

/// Resolves the adapter that serves a given task.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, task: &SyncTask) -> Result<Arc<dyn DataSourceAdapter>>;
}

/// Builds HTTP adapters from engine configuration, honouring per-task
/// endpoint and index overrides.
///
/// Snapshot adapters are cached per endpoint so their bearer token survives
/// across runs.
pub struct HttpAdapterFactory {
    client: reqwest::Client,
    config: Arc<EngineConfig>,
    snapshot_adapters: Mutex<HashMap<String, Arc<SnapshotAdapter>>>,
}

impl HttpAdapterFactory {
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.sync.adapter_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            snapshot_adapters: Mutex::new(HashMap::new()),
        })
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn adapter_for(&self, task: &SyncTask) -> Result<Arc<dyn DataSourceAdapter>> {
        match task.data_source {
            DataSourceKind::WindowAggregate => {
                let mut source = self.config.window_source.clone();
                if let Some(endpoint) = &task.endpoint_override {
                    source.endpoint = endpoint.clone();
                }
                if let Some(index) = &task.index_override {
                    source.index = index.clone();
                }
                Ok(Arc::new(WindowAggregateAdapter::new(
                    self.client.clone(),
                    source,
                )))
            }
            DataSourceKind::Snapshot => {
                let mut source = self.config.snapshot_source.clone();
                if let Some(endpoint) = &task.endpoint_override {
                    source.endpoint = endpoint.clone();
                }

                let mut cache = self.snapshot_adapters.lock().map_err(|_| {
                    EngineError::AdapterTransient("Snapshot adapter cache poisoned".to_string())
                })?;
                let adapter = cache
                    .entry(source.endpoint.clone())
                    .or_insert_with(|| Arc::new(SnapshotAdapter::new(self.client.clone(), source)))
                    .clone();
                Ok(adapter)
            }
        }
    }
}

/// Maps a non-success HTTP status to an adapter error, keeping the body short.
pub(crate) async fn status_error(source: &str, response: reqwest::Response) -> EngineError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(256).collect();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        EngineError::AdapterTransient(format!("{} rejected credentials ({})", source, status))
    } else {
        EngineError::AdapterTransient(format!("{} error ({}): {}", source, status, body.trim()))
    }
}
