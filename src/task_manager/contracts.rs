//! Contracts the engine requires of its persistence and remote collaborators.
//!
//! [`crate::task_manager::EngineStore`] implements every store trait on SQLite;
//! tests substitute their own fakes where a failure mode must be forced.

use crate::error::Result;
use crate::task_manager::models::{
    BatchSummary, DataSourceKind, HistoryStatus, HostInventoryRecord, MetricsUpsert,
    NewSyncDetail, RunFinalization, ScheduledVerificationTask, SyncTask, VerificationExecution,
    VerificationRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn list_active_host_ips(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait TaskConfigStore: Send + Sync {
    /// Enabled, non-deleted sync tasks, optionally restricted to one source kind.
    async fn list_enabled_sync_tasks(&self, kind: Option<DataSourceKind>) -> Result<Vec<SyncTask>>;

    async fn get_sync_task(&self, task_id: &str) -> Result<Option<SyncTask>>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<HostInventoryRecord>>;

    /// Returns the id of the host with `ip`, creating it when absent. Safe to
    /// call concurrently for the same IP.
    async fn insert_if_absent(&self, name: &str, ip: &str) -> Result<i64>;

    async fn upsert_metrics(&self, host_id: i64, ip: &str, metrics: &MetricsUpsert) -> Result<()>;
}

#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn create_run(
        &self,
        task: &SyncTask,
        started_at: DateTime<Utc>,
        total_hosts: u32,
    ) -> Result<String>;

    async fn finalize_run(&self, run_id: &str, finalization: RunFinalization) -> Result<()>;

    async fn append_detail(&self, detail: NewSyncDetail) -> Result<()>;
}

/// Answer of the remote execution service to a verification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub execution_task_id: String,
    pub accepted_hosts: u32,
    pub rejected_hosts: u32,
    pub message: Option<String>,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn submit(&self, request: &VerificationRequest) -> Result<SubmissionReceipt>;

    async fn query_status(&self, execution_task_id: &str) -> Result<Vec<VerificationExecution>>;
}

#[async_trait]
pub trait VerificationHistoryStore: Send + Sync {
    async fn list_enabled_scheduled_verifications(&self) -> Result<Vec<ScheduledVerificationTask>>;

    async fn get_scheduled_verification(
        &self,
        task_id: &str,
    ) -> Result<Option<ScheduledVerificationTask>>;

    async fn record_fire_times(
        &self,
        task_id: &str,
        last_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Inserts the per-firing history row with `failed` status and returns its id.
    async fn create_history(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
        total_hosts: u32,
    ) -> Result<i64>;

    async fn mark_history_submitted(
        &self,
        history_id: i64,
        execution_task_id: &str,
        status: HistoryStatus,
        message: Option<&str>,
    ) -> Result<()>;

    async fn mark_history_rejected(&self, history_id: i64, message: &str) -> Result<()>;

    /// Writes final tallies onto the history row correlated by execution-task id.
    /// Returns `false` when no scheduled firing owns that batch.
    async fn finalize_history(&self, execution_task_id: &str, summary: BatchSummary)
        -> Result<bool>;

    async fn record_host_executions(
        &self,
        execution_task_id: &str,
        executions: &[VerificationExecution],
    ) -> Result<()>;
}
