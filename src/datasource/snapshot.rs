use super::{status_error, DataSourceAdapter, HostMetrics, QueryOutcome, SnapshotMetrics};
use crate::config::SnapshotSourceConfig;
use crate::error::{EngineError, Result};
use crate::task_manager::models::DataSourceKind;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TOKEN_PATH: &str = "/api/v1/auth/token";
const METRICS_PATH: &str = "/api/v1/hosts/metrics";

/// Lifetime assumed when the auth endpoint omits `expiresIn`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    hosts: Vec<HostSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostSnapshot {
    ip: String,
    hostname: Option<String>,
    cpu_percent: Option<f64>,
    memory_percent: Option<f64>,
    disk_percent: Option<f64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Reads current utilisation percentages from the inventory metrics API.
///
/// Holds a single bearer token shared by every caller and refreshes it ahead
/// of expiry.
pub struct SnapshotAdapter {
    client: reqwest::Client,
    source: SnapshotSourceConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SnapshotAdapter {
    pub fn new(client: reqwest::Client, source: SnapshotSourceConfig) -> Self {
        Self {
            client,
            source,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.source.endpoint.trim_end_matches('/'), path)
    }

    async fn bearer_token(&self) -> Result<String> {
        let margin = Duration::from_secs(self.source.token_refresh_margin_secs);
        let mut guard = self.token.lock().await;

        if let Some(cached) = guard.as_ref() {
            if Instant::now() + margin < cached.expires_at {
                return Ok(cached.value.clone());
            }
            log::debug!("Refreshing snapshot source token for {}", self.source.endpoint);
        }

        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        let response = self
            .client
            .post(self.url(TOKEN_PATH))
            .json(&json!({
                "username": self.source.username,
                "password": self.source.password,
            }))
            .send()
            .await
            .map_err(|e| EngineError::AdapterTransient(format!("Auth request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error("Snapshot auth", response).await);
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            EngineError::AdapterTransient(format!("Failed to decode auth response: {}", e))
        })?;
        if body.token.trim().is_empty() {
            return Err(EngineError::AdapterTransient(
                "Snapshot auth returned an empty credential".to_string(),
            ));
        }

        let ttl = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS));
        Ok(CachedToken {
            value: body.token,
            expires_at: Instant::now() + ttl,
        })
    }

    async fn post_metrics(&self, ips: &[String]) -> Result<reqwest::Response> {
        let token = self.bearer_token().await?;
        self.client
            .post(self.url(METRICS_PATH))
            .bearer_auth(token)
            .json(&json!({ "ips": ips }))
            .send()
            .await
            .map_err(|e| EngineError::AdapterTransient(format!("Metrics request failed: {}", e)))
    }

    async fn fetch_chunk(&self, ips: &[String]) -> Result<HashMap<String, QueryOutcome>> {
        let mut response = self.post_metrics(ips).await?;

        // A token revoked upstream before its expiry gets one fresh retry.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            response = self.post_metrics(ips).await?;
        }
        if !response.status().is_success() {
            return Err(status_error("Snapshot source", response).await);
        }

        let body: MetricsResponse = response.json().await.map_err(|e| {
            EngineError::AdapterTransient(format!("Failed to decode metrics response: {}", e))
        })?;

        let mut out: HashMap<String, QueryOutcome> = ips
            .iter()
            .map(|ip| (ip.clone(), QueryOutcome::NoData))
            .collect();
        for host in body.hosts {
            if let Some(slot) = out.get_mut(host.ip.trim()) {
                *slot = QueryOutcome::Found(HostMetrics::Snapshot(SnapshotMetrics {
                    host_name: host.hostname,
                    cpu_percent: host.cpu_percent,
                    memory_percent: host.memory_percent,
                    disk_percent: host.disk_percent,
                }));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DataSourceAdapter for SnapshotAdapter {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Snapshot
    }

    async fn query_host_metrics(&self, ip: &str, _window: Duration) -> Result<QueryOutcome> {
        let ips = [ip.to_string()];
        let mut result = self.fetch_chunk(&ips).await?;
        Ok(result.remove(ip).unwrap_or(QueryOutcome::NoData))
    }

    fn batch_size(&self) -> Option<usize> {
        Some(self.source.batch_size.max(1))
    }

    async fn query_batch(
        &self,
        ips: &[String],
        _window: Duration,
    ) -> Result<HashMap<String, QueryOutcome>> {
        let mut out = HashMap::with_capacity(ips.len());
        for chunk in ips.chunks(self.source.batch_size.max(1)) {
            out.extend(self.fetch_chunk(chunk).await?);
        }
        Ok(out)
    }
}
