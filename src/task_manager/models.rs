use crate::error::{EngineError, Result};
use crate::task_manager::cron::CronSchedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    #[default]
    WindowAggregate,
    Snapshot,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowAggregate => "window_aggregate",
            Self::Snapshot => "snapshot",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "window_aggregate" => Ok(Self::WindowAggregate),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(EngineError::Persistence(format!(
                "Invalid data source kind in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    #[default]
    Running,
    Success,
    Partial,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(EngineError::Persistence(format!(
                "Invalid run status in storage: {}",
                value
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Aggregate status of a finished run from its per-host counts.
    ///
    /// Not-in-source hosts count against success even though they are stored
    /// apart from hard failures.
    pub fn from_counts(success: u32, failed: u32, not_in_source: u32) -> Self {
        if success == 0 {
            Self::Failed
        } else if failed == 0 && not_in_source == 0 {
            Self::Success
        } else {
            Self::Partial
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Success,
    Failed,
    NotInSource,
}

impl DetailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::NotInSource => "not_in_source",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "not_in_source" => Ok(Self::NotInSource),
            _ => Err(EngineError::Persistence(format!(
                "Invalid detail status in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Cpu,
    Memory,
    Disk,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "cpu" => Ok(Self::Cpu),
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            _ => Err(EngineError::Persistence(format!(
                "Invalid resource type in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(EngineError::Persistence(format!(
                "Invalid execution status in storage: {}",
                value
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Partial,
    #[default]
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(EngineError::Persistence(format!(
                "Invalid history status in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub data_source: DataSourceKind,
    pub enabled: bool,
    /// Look-back window such as `15m`; empty means the configured default.
    pub query_window: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub endpoint_override: Option<String>,
    pub index_override: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSyncTaskRequest {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub data_source: DataSourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub query_window: String,
    pub endpoint_override: Option<String>,
    pub index_override: Option<String>,
}

impl CreateSyncTaskRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "Sync task name cannot be empty".to_string(),
            ));
        }
        CronSchedule::parse(&self.cron_expression)?;
        if !self.query_window.trim().is_empty() {
            parse_query_window(&self.query_window)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSyncTaskRequest {
    pub task_id: String,
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub data_source: Option<DataSourceKind>,
    pub enabled: Option<bool>,
    pub query_window: Option<String>,
    pub endpoint_override: Option<String>,
    pub index_override: Option<String>,
}

impl UpdateSyncTaskRequest {
    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("Task id is required".to_string()));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(EngineError::InvalidInput(
                    "Sync task name cannot be empty".to_string(),
                ));
            }
        }
        if let Some(expr) = &self.cron_expression {
            CronSchedule::parse(expr)?;
        }
        if let Some(window) = &self.query_window {
            if !window.trim().is_empty() {
                parse_query_window(window)?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncExecutionRun {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_hosts: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub not_in_source_count: u32,
    pub duration_ms: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunFinalization {
    pub status: SyncRunStatus,
    pub success_count: u32,
    pub failed_count: u32,
    pub not_in_source_count: u32,
    pub duration_ms: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncExecutionDetail {
    pub id: i64,
    pub run_id: String,
    pub host_ip: String,
    pub host_name: Option<String>,
    pub status: DetailStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metric_snapshot: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncDetail {
    pub run_id: String,
    pub host_ip: String,
    pub host_name: Option<String>,
    pub status: DetailStatus,
    pub error_message: Option<String>,
    pub metric_snapshot: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostInventoryRecord {
    pub id: i64,
    pub ip: String,
    pub name: String,
    pub pool: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reconciled values written onto an inventory host.
///
/// Percent fields are 0-100. Byte fields are absolute usage. A `None` leaves
/// the previously stored value in place, so the two adapter pipelines never
/// overwrite each other's quantities.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpsert {
    pub source: DataSourceKind,
    pub cpu_percent: Option<f64>,
    pub cpu_avg_percent: Option<f64>,
    pub cpu_min_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub memory_used_bytes: Option<f64>,
    pub memory_used_avg_bytes: Option<f64>,
    pub disk_used_bytes: Option<f64>,
    pub disk_used_avg_bytes: Option<f64>,
    pub data_points: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredHostMetrics {
    pub host_id: i64,
    pub ip: String,
    pub source: DataSourceKind,
    pub cpu_percent: Option<f64>,
    pub cpu_avg_percent: Option<f64>,
    pub cpu_min_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub memory_used_bytes: Option<f64>,
    pub memory_used_avg_bytes: Option<f64>,
    pub disk_used_bytes: Option<f64>,
    pub disk_used_avg_bytes: Option<f64>,
    pub data_points: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub host_ips: Vec<String>,
    pub resource_type: ResourceType,
    pub target_percent: u8,
    pub duration_secs: u64,
    #[serde(default)]
    pub force: bool,
}

impl VerificationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.host_ips.iter().all(|ip| ip.trim().is_empty()) {
            return Err(EngineError::InvalidInput(
                "Verification requires at least one host".to_string(),
            ));
        }
        if self.target_percent == 0 || self.target_percent > 100 {
            return Err(EngineError::InvalidInput(format!(
                "Target load must be within 1-100, got {}",
                self.target_percent
            )));
        }
        if self.duration_secs == 0 {
            return Err(EngineError::InvalidInput(
                "Verification duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-host state of one verification batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationExecution {
    pub host_ip: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
}

/// Final tallies of a verification batch whose hosts are all terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub status: HistoryStatus,
    pub total_hosts: u32,
    pub completed_hosts: u32,
    pub failed_hosts: u32,
}

impl BatchSummary {
    /// Returns `None` while any host is still pending or running, or when the
    /// service has not reported any host yet.
    pub fn from_executions(executions: &[VerificationExecution]) -> Option<Self> {
        if executions.is_empty() || executions.iter().any(|e| !e.status.is_terminal()) {
            return None;
        }

        let completed = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count() as u32;
        let total = executions.len() as u32;
        let status = if completed == total {
            HistoryStatus::Success
        } else if completed == 0 {
            HistoryStatus::Failed
        } else {
            HistoryStatus::Partial
        };

        Some(Self {
            status,
            total_hosts: total,
            completed_hosts: completed,
            failed_hosts: total - completed,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledVerificationTask {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub host_ips: Vec<String>,
    pub resource_type: ResourceType,
    pub target_percent: u8,
    pub duration_secs: u64,
    pub force: bool,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledVerificationTask {
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    pub fn to_request(&self) -> VerificationRequest {
        VerificationRequest {
            host_ips: self.host_ips.clone(),
            resource_type: self.resource_type,
            target_percent: self.target_percent,
            duration_secs: self.duration_secs,
            force: self.force,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledVerificationRequest {
    pub name: String,
    pub cron_expression: String,
    pub host_ips: Vec<String>,
    #[serde(default)]
    pub resource_type: ResourceType,
    pub target_percent: u8,
    pub duration_secs: u64,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CreateScheduledVerificationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "Scheduled verification name cannot be empty".to_string(),
            ));
        }
        CronSchedule::parse(&self.cron_expression)?;
        VerificationRequest {
            host_ips: self.host_ips.clone(),
            resource_type: self.resource_type,
            target_percent: self.target_percent,
            duration_secs: self.duration_secs,
            force: self.force,
        }
        .validate()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskExecutionHistory {
    pub id: i64,
    pub task_id: String,
    pub execution_task_id: Option<String>,
    pub status: HistoryStatus,
    pub message: Option<String>,
    pub total_hosts: u32,
    pub completed_hosts: u32,
    pub failed_hosts: u32,
    pub fired_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parses a look-back window like `30s`, `15m`, `2h` or `7d` into seconds.
pub fn parse_query_window(window: &str) -> Result<u64> {
    let trimmed = window.trim();
    let invalid = || {
        EngineError::InvalidInput(format!(
            "Invalid query window '{}': expected <n>s, <n>m, <n>h or <n>d",
            window
        ))
    };

    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return Err(invalid()),
    };
    let amount: u64 = trimmed[..trimmed.len() - 1]
        .parse()
        .map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    Ok(amount.saturating_mul(multiplier))
}

pub fn normalize_host_ips(ips: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ip in ips {
        let normalized = ip.trim();
        if normalized.is_empty() || out.iter().any(|existing| existing == normalized) {
            continue;
        }
        out.push(normalized.to_string());
    }
    out
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests;
