use crate::error::{EngineError, Result};
use crate::task_manager::contracts::{
    ExecutionLogStore, HostDirectory, InventoryStore, TaskConfigStore, VerificationHistoryStore,
};
use crate::task_manager::models::{
    normalize_host_ips, BatchSummary, CreateScheduledVerificationRequest, CreateSyncTaskRequest,
    DataSourceKind, DetailStatus, ExecutionStatus, HistoryStatus, HostInventoryRecord,
    MetricsUpsert, NewSyncDetail, ResourceType, RunFinalization, ScheduledTaskExecutionHistory,
    ScheduledVerificationTask, StoredHostMetrics, SyncExecutionDetail, SyncExecutionRun,
    SyncRunStatus, SyncTask, UpdateSyncTaskRequest, VerificationExecution,
};
use crate::task_manager::security::{redact_sensitive_json, sanitize_error_message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::fmt::Display;

/// SQLite-backed implementation of every store contract the engine consumes.
#[derive(Clone, Debug)]
pub struct EngineStore {
    pool: Pool<Sqlite>,
}

const SYNC_TASK_COLUMNS: &str = "id, name, cron_expression, data_source, enabled, query_window, \
     deleted_at, endpoint_override, index_override, created_at, updated_at";

const SCHEDULED_VERIFICATION_COLUMNS: &str = "id, name, cron_expression, host_ips, resource_type, \
     target_percent, duration_secs, force_run, enabled, deleted_at, last_fire_at, next_fire_at, \
     created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, task_id, execution_task_id, status, message, total_hosts, \
     completed_hosts, failed_hosts, fired_at, finished_at";

impl EngineStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                data_source TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                query_window TEXT NOT NULL DEFAULT '',
                deleted_at INTEGER,
                endpoint_override TEXT,
                index_override TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS host_directory (
                ip TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 1,
                added_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                pool TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS host_metrics (
                host_id INTEGER PRIMARY KEY,
                ip TEXT NOT NULL,
                source TEXT NOT NULL,
                cpu_percent REAL,
                cpu_avg_percent REAL,
                cpu_min_percent REAL,
                memory_percent REAL,
                disk_percent REAL,
                memory_used_bytes REAL,
                memory_used_avg_bytes REAL,
                disk_used_bytes REAL,
                disk_used_avg_bytes REAL,
                data_points INTEGER,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (host_id) REFERENCES hosts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sync_execution_runs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                total_hosts INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                not_in_source_count INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS sync_execution_details (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                host_ip TEXT NOT NULL,
                host_name TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                metric_snapshot TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (run_id) REFERENCES sync_execution_runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS scheduled_verification_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                host_ips TEXT NOT NULL DEFAULT '[]',
                resource_type TEXT NOT NULL,
                target_percent INTEGER NOT NULL,
                duration_secs INTEGER NOT NULL,
                force_run INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                deleted_at INTEGER,
                last_fire_at INTEGER,
                next_fire_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_task_execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                execution_task_id TEXT,
                status TEXT NOT NULL,
                message TEXT,
                total_hosts INTEGER NOT NULL DEFAULT 0,
                completed_hosts INTEGER NOT NULL DEFAULT 0,
                failed_hosts INTEGER NOT NULL DEFAULT 0,
                fired_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS verification_executions (
                execution_task_id TEXT NOT NULL,
                host_ip TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                exit_code INTEGER,
                stdout_log TEXT,
                stderr_log TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (execution_task_id, host_ip)
            );

            CREATE INDEX IF NOT EXISTS idx_sync_tasks_enabled ON sync_tasks(enabled, deleted_at);
            CREATE INDEX IF NOT EXISTS idx_sync_runs_task_started ON sync_execution_runs(task_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sync_details_run ON sync_execution_details(run_id, id ASC);
            CREATE INDEX IF NOT EXISTS idx_history_task_fired ON scheduled_task_execution_history(task_id, fired_at DESC);
            CREATE INDEX IF NOT EXISTS idx_history_execution ON scheduled_task_execution_history(execution_task_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to init engine schema"))?;

        Ok(())
    }

    // --- Sync task management ---

    pub async fn create_sync_task(&self, request: CreateSyncTaskRequest) -> Result<SyncTask> {
        request.validate()?;

        let now = Utc::now().timestamp();
        let task = SyncTask {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            cron_expression: request.cron_expression.trim().to_string(),
            data_source: request.data_source,
            enabled: request.enabled,
            query_window: request.query_window.trim().to_string(),
            deleted_at: None,
            endpoint_override: request.endpoint_override.and_then(trim_to_option),
            index_override: request.index_override.and_then(trim_to_option),
            created_at: timestamp_to_datetime(now),
            updated_at: timestamp_to_datetime(now),
        };

        sqlx::query(
            r#"
            INSERT INTO sync_tasks (
                id, name, cron_expression, data_source, enabled, query_window,
                deleted_at, endpoint_override, index_override, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(task.data_source.as_str())
        .bind(bool_to_int(task.enabled))
        .bind(&task.query_window)
        .bind(&task.endpoint_override)
        .bind(&task.index_override)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to create sync task"))?;

        Ok(task)
    }

    pub async fn update_sync_task(&self, request: UpdateSyncTaskRequest) -> Result<SyncTask> {
        request.validate()?;

        let mut task = self
            .get_sync_task(&request.task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Sync task '{}'", request.task_id)))?;

        if let Some(name) = request.name {
            task.name = name.trim().to_string();
        }
        if let Some(expr) = request.cron_expression {
            task.cron_expression = expr.trim().to_string();
        }
        if let Some(kind) = request.data_source {
            task.data_source = kind;
        }
        if let Some(enabled) = request.enabled {
            task.enabled = enabled;
        }
        if let Some(window) = request.query_window {
            task.query_window = window.trim().to_string();
        }
        if let Some(endpoint) = request.endpoint_override {
            task.endpoint_override = trim_to_option(endpoint);
        }
        if let Some(index) = request.index_override {
            task.index_override = trim_to_option(index);
        }
        task.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE sync_tasks
            SET name = ?, cron_expression = ?, data_source = ?, enabled = ?, query_window = ?,
                endpoint_override = ?, index_override = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(task.data_source.as_str())
        .bind(bool_to_int(task.enabled))
        .bind(&task.query_window)
        .bind(&task.endpoint_override)
        .bind(&task.index_override)
        .bind(task.updated_at.timestamp())
        .bind(&task.id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to update sync task '{}'", task.id)))?;

        Ok(task)
    }

    pub async fn soft_delete_sync_task(&self, task_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE sync_tasks SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to delete sync task '{}'", task_id)))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("Sync task '{}'", task_id)));
        }
        Ok(())
    }

    // --- Host directory ---

    pub async fn register_host(&self, ip: &str) -> Result<()> {
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(EngineError::InvalidInput("Host ip cannot be empty".to_string()));
        }
        sqlx::query(
            r#"
            INSERT INTO host_directory (ip, active, added_at)
            VALUES (?, 1, ?)
            ON CONFLICT(ip) DO UPDATE SET active = 1
            "#,
        )
        .bind(ip)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to register host '{}'", ip)))?;
        Ok(())
    }

    pub async fn deactivate_host(&self, ip: &str) -> Result<()> {
        sqlx::query("UPDATE host_directory SET active = 0 WHERE ip = ?")
            .bind(ip.trim())
            .execute(&self.pool)
            .await
            .map_err(db_err(format!("Failed to deactivate host '{}'", ip)))?;
        Ok(())
    }

    // --- Inventory reads ---

    pub async fn list_inventory_hosts(&self) -> Result<Vec<HostInventoryRecord>> {
        let rows = sqlx::query(
            "SELECT id, ip, name, pool, active, created_at, updated_at FROM hosts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list inventory hosts"))?;

        rows.iter().map(Self::row_to_host).collect()
    }

    pub async fn get_host_metrics(&self, host_id: i64) -> Result<Option<StoredHostMetrics>> {
        let row = sqlx::query(
            r#"
            SELECT host_id, ip, source, cpu_percent, cpu_avg_percent, cpu_min_percent,
                   memory_percent, disk_percent, memory_used_bytes, memory_used_avg_bytes,
                   disk_used_bytes, disk_used_avg_bytes, data_points, updated_at
            FROM host_metrics
            WHERE host_id = ?
            "#,
        )
        .bind(host_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("Failed to fetch metrics for host {}", host_id)))?;

        row.as_ref().map(Self::row_to_host_metrics).transpose()
    }

    // --- Run history reads ---

    pub async fn get_run(&self, run_id: &str) -> Result<Option<SyncExecutionRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, task_name, status, started_at, finished_at, total_hosts,
                   success_count, failed_count, not_in_source_count, duration_ms
            FROM sync_execution_runs
            WHERE id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("Failed to fetch run '{}'", run_id)))?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    pub async fn list_runs(&self, task_id: &str, limit: i64) -> Result<Vec<SyncExecutionRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, task_name, status, started_at, finished_at, total_hosts,
                   success_count, failed_count, not_in_source_count, duration_ms
            FROM sync_execution_runs
            WHERE task_id = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!("Failed to list runs for task '{}'", task_id)))?;

        rows.iter().map(Self::row_to_run).collect()
    }

    pub async fn list_details(&self, run_id: &str) -> Result<Vec<SyncExecutionDetail>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, host_ip, host_name, status, error_message, metric_snapshot, created_at
            FROM sync_execution_details
            WHERE run_id = ?
            ORDER BY host_ip ASC, id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!("Failed to list details for run '{}'", run_id)))?;

        rows.iter().map(Self::row_to_detail).collect()
    }

    // --- Scheduled verification management ---

    pub async fn create_scheduled_verification(
        &self,
        request: CreateScheduledVerificationRequest,
    ) -> Result<ScheduledVerificationTask> {
        request.validate()?;

        let now = Utc::now().timestamp();
        let task = ScheduledVerificationTask {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            cron_expression: request.cron_expression.trim().to_string(),
            host_ips: normalize_host_ips(&request.host_ips),
            resource_type: request.resource_type,
            target_percent: request.target_percent,
            duration_secs: request.duration_secs,
            force: request.force,
            enabled: request.enabled,
            deleted_at: None,
            last_fire_at: None,
            next_fire_at: None,
            created_at: timestamp_to_datetime(now),
            updated_at: timestamp_to_datetime(now),
        };
        let host_ips_json = serde_json::to_string(&task.host_ips)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_verification_tasks (
                id, name, cron_expression, host_ips, resource_type, target_percent, duration_secs,
                force_run, enabled, deleted_at, last_fire_at, next_fire_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(host_ips_json)
        .bind(task.resource_type.as_str())
        .bind(i64::from(task.target_percent))
        .bind(task.duration_secs as i64)
        .bind(bool_to_int(task.force))
        .bind(bool_to_int(task.enabled))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to create scheduled verification"))?;

        Ok(task)
    }

    pub async fn set_scheduled_verification_enabled(
        &self,
        task_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scheduled_verification_tasks SET enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(bool_to_int(enabled))
        .bind(Utc::now().timestamp())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to toggle scheduled verification '{}'", task_id)))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!(
                "Scheduled verification '{}'",
                task_id
            )));
        }
        Ok(())
    }

    pub async fn soft_delete_scheduled_verification(&self, task_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE scheduled_verification_tasks SET deleted_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to delete scheduled verification '{}'", task_id)))?;
        Ok(())
    }

    pub async fn get_history(
        &self,
        history_id: i64,
    ) -> Result<Option<ScheduledTaskExecutionHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_task_execution_history WHERE id = ?",
            HISTORY_COLUMNS
        ))
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("Failed to fetch history {}", history_id)))?;

        row.as_ref().map(Self::row_to_history).transpose()
    }

    pub async fn get_history_by_execution(
        &self,
        execution_task_id: &str,
    ) -> Result<Option<ScheduledTaskExecutionHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_task_execution_history WHERE execution_task_id = ?",
            HISTORY_COLUMNS
        ))
        .bind(execution_task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!(
            "Failed to fetch history for execution '{}'",
            execution_task_id
        )))?;

        row.as_ref().map(Self::row_to_history).transpose()
    }

    pub async fn list_history(&self, task_id: &str) -> Result<Vec<ScheduledTaskExecutionHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_task_execution_history WHERE task_id = ? ORDER BY fired_at DESC, id DESC",
            HISTORY_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!("Failed to list history for '{}'", task_id)))?;

        rows.iter().map(Self::row_to_history).collect()
    }

    pub async fn list_host_executions(
        &self,
        execution_task_id: &str,
    ) -> Result<Vec<VerificationExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT host_ip, status, started_at, finished_at, exit_code, stdout_log, stderr_log
            FROM verification_executions
            WHERE execution_task_id = ?
            ORDER BY host_ip ASC
            "#,
        )
        .bind(execution_task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!(
            "Failed to list executions for '{}'",
            execution_task_id
        )))?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    // --- Row mappers ---

    fn row_to_sync_task(row: &SqliteRow) -> Result<SyncTask> {
        let deleted_at: Option<i64> = row.try_get("deleted_at")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(SyncTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            data_source: DataSourceKind::from_db(&row.try_get::<String, _>("data_source")?)?,
            enabled: row.try_get::<i64, _>("enabled")? == 1,
            query_window: row.try_get("query_window")?,
            deleted_at: deleted_at.map(timestamp_to_datetime),
            endpoint_override: row.try_get("endpoint_override")?,
            index_override: row.try_get("index_override")?,
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_host(row: &SqliteRow) -> Result<HostInventoryRecord> {
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(HostInventoryRecord {
            id: row.try_get("id")?,
            ip: row.try_get("ip")?,
            name: row.try_get("name")?,
            pool: row.try_get("pool")?,
            active: row.try_get::<i64, _>("active")? == 1,
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_host_metrics(row: &SqliteRow) -> Result<StoredHostMetrics> {
        let data_points: Option<i64> = row.try_get("data_points")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(StoredHostMetrics {
            host_id: row.try_get("host_id")?,
            ip: row.try_get("ip")?,
            source: DataSourceKind::from_db(&row.try_get::<String, _>("source")?)?,
            cpu_percent: row.try_get("cpu_percent")?,
            cpu_avg_percent: row.try_get("cpu_avg_percent")?,
            cpu_min_percent: row.try_get("cpu_min_percent")?,
            memory_percent: row.try_get("memory_percent")?,
            disk_percent: row.try_get("disk_percent")?,
            memory_used_bytes: row.try_get("memory_used_bytes")?,
            memory_used_avg_bytes: row.try_get("memory_used_avg_bytes")?,
            disk_used_bytes: row.try_get("disk_used_bytes")?,
            disk_used_avg_bytes: row.try_get("disk_used_avg_bytes")?,
            data_points: data_points.map(|v| v.max(0) as u64),
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_run(row: &SqliteRow) -> Result<SyncExecutionRun> {
        let started_at: i64 = row.try_get("started_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;

        Ok(SyncExecutionRun {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            task_name: row.try_get("task_name")?,
            status: SyncRunStatus::from_db(&row.try_get::<String, _>("status")?)?,
            started_at: timestamp_to_datetime(started_at),
            finished_at: finished_at.map(timestamp_to_datetime),
            total_hosts: count_column(row, "total_hosts")?,
            success_count: count_column(row, "success_count")?,
            failed_count: count_column(row, "failed_count")?,
            not_in_source_count: count_column(row, "not_in_source_count")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn row_to_detail(row: &SqliteRow) -> Result<SyncExecutionDetail> {
        let created_at: i64 = row.try_get("created_at")?;
        let snapshot_raw: Option<String> = row.try_get("metric_snapshot")?;
        let metric_snapshot = snapshot_raw
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(|e| {
                EngineError::Persistence(format!("Failed to decode metric snapshot: {}", e))
            })?;

        Ok(SyncExecutionDetail {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            host_ip: row.try_get("host_ip")?,
            host_name: row.try_get("host_name")?,
            status: DetailStatus::from_db(&row.try_get::<String, _>("status")?)?,
            error_message: row.try_get("error_message")?,
            metric_snapshot,
            created_at: timestamp_to_datetime(created_at),
        })
    }

    fn row_to_scheduled_verification(row: &SqliteRow) -> Result<ScheduledVerificationTask> {
        let host_ips_raw: String = row
            .try_get("host_ips")
            .unwrap_or_else(|_| "[]".to_string());
        let host_ips: Vec<String> = serde_json::from_str(&host_ips_raw).map_err(|e| {
            EngineError::Persistence(format!("Failed to decode verification hosts: {}", e))
        })?;
        let target_percent: i64 = row.try_get("target_percent")?;
        let duration_secs: i64 = row.try_get("duration_secs")?;
        let deleted_at: Option<i64> = row.try_get("deleted_at")?;
        let last_fire_at: Option<i64> = row.try_get("last_fire_at")?;
        let next_fire_at: Option<i64> = row.try_get("next_fire_at")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(ScheduledVerificationTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            host_ips,
            resource_type: ResourceType::from_db(&row.try_get::<String, _>("resource_type")?)?,
            target_percent: target_percent.clamp(0, 100) as u8,
            duration_secs: duration_secs.max(0) as u64,
            force: row.try_get::<i64, _>("force_run")? == 1,
            enabled: row.try_get::<i64, _>("enabled")? == 1,
            deleted_at: deleted_at.map(timestamp_to_datetime),
            last_fire_at: last_fire_at.map(timestamp_to_datetime),
            next_fire_at: next_fire_at.map(timestamp_to_datetime),
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_history(row: &SqliteRow) -> Result<ScheduledTaskExecutionHistory> {
        let fired_at: i64 = row.try_get("fired_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;

        Ok(ScheduledTaskExecutionHistory {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            execution_task_id: row.try_get("execution_task_id")?,
            status: HistoryStatus::from_db(&row.try_get::<String, _>("status")?)?,
            message: row.try_get("message")?,
            total_hosts: count_column(row, "total_hosts")?,
            completed_hosts: count_column(row, "completed_hosts")?,
            failed_hosts: count_column(row, "failed_hosts")?,
            fired_at: timestamp_to_datetime(fired_at),
            finished_at: finished_at.map(timestamp_to_datetime),
        })
    }

    fn row_to_execution(row: &SqliteRow) -> Result<VerificationExecution> {
        let started_at: Option<i64> = row.try_get("started_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;
        let exit_code: Option<i64> = row.try_get("exit_code")?;

        Ok(VerificationExecution {
            host_ip: row.try_get("host_ip")?,
            status: ExecutionStatus::from_db(&row.try_get::<String, _>("status")?)?,
            started_at: started_at.map(timestamp_to_datetime),
            finished_at: finished_at.map(timestamp_to_datetime),
            exit_code: exit_code.map(|code| code as i32),
            stdout_log: row.try_get("stdout_log")?,
            stderr_log: row.try_get("stderr_log")?,
        })
    }
}

#[async_trait]
impl HostDirectory for EngineStore {
    async fn list_active_host_ips(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT ip FROM host_directory WHERE active = 1 ORDER BY ip ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list active hosts"))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("ip").map_err(EngineError::from))
            .collect()
    }
}

#[async_trait]
impl TaskConfigStore for EngineStore {
    async fn list_enabled_sync_tasks(&self, kind: Option<DataSourceKind>) -> Result<Vec<SyncTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM sync_tasks
            WHERE enabled = 1 AND deleted_at IS NULL AND (? IS NULL OR data_source = ?)
            ORDER BY created_at ASC, id ASC
            "#,
            SYNC_TASK_COLUMNS
        ))
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list enabled sync tasks"))?;

        rows.iter().map(Self::row_to_sync_task).collect()
    }

    async fn get_sync_task(&self, task_id: &str) -> Result<Option<SyncTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sync_tasks WHERE id = ?",
            SYNC_TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("Failed to fetch sync task '{}'", task_id)))?;

        row.as_ref().map(Self::row_to_sync_task).transpose()
    }
}

#[async_trait]
impl InventoryStore for EngineStore {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<HostInventoryRecord>> {
        let row = sqlx::query(
            "SELECT id, ip, name, pool, active, created_at, updated_at FROM hosts WHERE ip = ?",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("Failed to look up host '{}'", ip)))?;

        row.as_ref().map(Self::row_to_host).transpose()
    }

    async fn insert_if_absent(&self, name: &str, ip: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let name = if name.trim().is_empty() { ip } else { name.trim() };

        // The UNIQUE(ip) constraint arbitrates concurrent inserts; the loser
        // falls through to the select below.
        sqlx::query(
            r#"
            INSERT INTO hosts (ip, name, pool, active, created_at, updated_at)
            VALUES (?, ?, NULL, 1, ?, ?)
            ON CONFLICT(ip) DO NOTHING
            "#,
        )
        .bind(ip)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to insert host '{}'", ip)))?;

        let row = sqlx::query("SELECT id FROM hosts WHERE ip = ?")
            .bind(ip)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err(format!("Failed to resolve host id for '{}'", ip)))?;

        Ok(row.try_get("id")?)
    }

    async fn upsert_metrics(&self, host_id: i64, ip: &str, metrics: &MetricsUpsert) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO host_metrics (
                host_id, ip, source, cpu_percent, cpu_avg_percent, cpu_min_percent,
                memory_percent, disk_percent, memory_used_bytes, memory_used_avg_bytes,
                disk_used_bytes, disk_used_avg_bytes, data_points, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(host_id) DO UPDATE SET
                ip = excluded.ip,
                source = excluded.source,
                cpu_percent = COALESCE(excluded.cpu_percent, host_metrics.cpu_percent),
                cpu_avg_percent = COALESCE(excluded.cpu_avg_percent, host_metrics.cpu_avg_percent),
                cpu_min_percent = COALESCE(excluded.cpu_min_percent, host_metrics.cpu_min_percent),
                memory_percent = COALESCE(excluded.memory_percent, host_metrics.memory_percent),
                disk_percent = COALESCE(excluded.disk_percent, host_metrics.disk_percent),
                memory_used_bytes = COALESCE(excluded.memory_used_bytes, host_metrics.memory_used_bytes),
                memory_used_avg_bytes = COALESCE(excluded.memory_used_avg_bytes, host_metrics.memory_used_avg_bytes),
                disk_used_bytes = COALESCE(excluded.disk_used_bytes, host_metrics.disk_used_bytes),
                disk_used_avg_bytes = COALESCE(excluded.disk_used_avg_bytes, host_metrics.disk_used_avg_bytes),
                data_points = COALESCE(excluded.data_points, host_metrics.data_points),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(host_id)
        .bind(ip)
        .bind(metrics.source.as_str())
        .bind(metrics.cpu_percent)
        .bind(metrics.cpu_avg_percent)
        .bind(metrics.cpu_min_percent)
        .bind(metrics.memory_percent)
        .bind(metrics.disk_percent)
        .bind(metrics.memory_used_bytes)
        .bind(metrics.memory_used_avg_bytes)
        .bind(metrics.disk_used_bytes)
        .bind(metrics.disk_used_avg_bytes)
        .bind(metrics.data_points.map(|v| v as i64))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to upsert metrics for '{}'", ip)))?;

        sqlx::query("UPDATE hosts SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(host_id)
            .execute(&self.pool)
            .await
            .map_err(db_err(format!("Failed to touch host '{}'", ip)))?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionLogStore for EngineStore {
    async fn create_run(
        &self,
        task: &SyncTask,
        started_at: DateTime<Utc>,
        total_hosts: u32,
    ) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO sync_execution_runs (
                id, task_id, task_name, status, started_at, finished_at, total_hosts,
                success_count, failed_count, not_in_source_count, duration_ms
            )
            VALUES (?, ?, ?, ?, ?, NULL, ?, 0, 0, 0, NULL)
            "#,
        )
        .bind(&run_id)
        .bind(&task.id)
        .bind(&task.name)
        .bind(SyncRunStatus::Running.as_str())
        .bind(started_at.timestamp())
        .bind(i64::from(total_hosts))
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to create run for task '{}'", task.id)))?;

        Ok(run_id)
    }

    async fn finalize_run(&self, run_id: &str, finalization: RunFinalization) -> Result<()> {
        if !finalization.status.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "Run '{}' cannot be finalized as {}",
                run_id,
                finalization.status.as_str()
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE sync_execution_runs
            SET status = ?, finished_at = ?, success_count = ?, failed_count = ?,
                not_in_source_count = ?, duration_ms = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(finalization.status.as_str())
        .bind(Utc::now().timestamp())
        .bind(i64::from(finalization.success_count))
        .bind(i64::from(finalization.failed_count))
        .bind(i64::from(finalization.not_in_source_count))
        .bind(finalization.duration_ms.max(0))
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to finalize run '{}'", run_id)))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Persistence(format!(
                "Run '{}' is missing or already finalized",
                run_id
            )));
        }
        Ok(())
    }

    async fn append_detail(&self, detail: NewSyncDetail) -> Result<()> {
        let error_message = detail
            .error_message
            .as_deref()
            .map(sanitize_error_message)
            .and_then(trim_to_option);
        let snapshot_json = detail
            .metric_snapshot
            .as_ref()
            .map(|snapshot| serde_json::to_string(&redact_sensitive_json(snapshot)))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_execution_details (
                run_id, host_ip, host_name, status, error_message, metric_snapshot, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&detail.run_id)
        .bind(&detail.host_ip)
        .bind(&detail.host_name)
        .bind(detail.status.as_str())
        .bind(error_message)
        .bind(snapshot_json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err(format!(
            "Failed to append detail for '{}' in run '{}'",
            detail.host_ip, detail.run_id
        )))?;

        Ok(())
    }
}

#[async_trait]
impl VerificationHistoryStore for EngineStore {
    async fn list_enabled_scheduled_verifications(&self) -> Result<Vec<ScheduledVerificationTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM scheduled_verification_tasks
            WHERE enabled = 1 AND deleted_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
            SCHEDULED_VERIFICATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list scheduled verifications"))?;

        rows.iter().map(Self::row_to_scheduled_verification).collect()
    }

    async fn get_scheduled_verification(
        &self,
        task_id: &str,
    ) -> Result<Option<ScheduledVerificationTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_verification_tasks WHERE id = ?",
            SCHEDULED_VERIFICATION_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!(
            "Failed to fetch scheduled verification '{}'",
            task_id
        )))?;

        row.as_ref()
            .map(Self::row_to_scheduled_verification)
            .transpose()
    }

    async fn record_fire_times(
        &self,
        task_id: &str,
        last_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_verification_tasks
            SET last_fire_at = ?, next_fire_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(last_fire_at.timestamp())
        .bind(next_fire_at.map(|v| v.timestamp()))
        .bind(Utc::now().timestamp())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to record fire times for '{}'", task_id)))?;
        Ok(())
    }

    async fn create_history(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
        total_hosts: u32,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_task_execution_history (
                task_id, execution_task_id, status, message, total_hosts,
                completed_hosts, failed_hosts, fired_at, finished_at
            )
            VALUES (?, NULL, ?, NULL, ?, 0, 0, ?, NULL)
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(HistoryStatus::Failed.as_str())
        .bind(i64::from(total_hosts))
        .bind(fired_at.timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err(format!("Failed to create history for '{}'", task_id)))?;

        Ok(row.try_get("id")?)
    }

    async fn mark_history_submitted(
        &self,
        history_id: i64,
        execution_task_id: &str,
        status: HistoryStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_task_execution_history
            SET execution_task_id = ?, status = ?, message = ?
            WHERE id = ?
            "#,
        )
        .bind(execution_task_id)
        .bind(status.as_str())
        .bind(message.map(sanitize_error_message))
        .bind(history_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to mark history {} submitted", history_id)))?;
        Ok(())
    }

    async fn mark_history_rejected(&self, history_id: i64, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_task_execution_history
            SET status = ?, message = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(HistoryStatus::Failed.as_str())
        .bind(sanitize_error_message(message))
        .bind(Utc::now().timestamp())
        .bind(history_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("Failed to mark history {} rejected", history_id)))?;
        Ok(())
    }

    async fn finalize_history(
        &self,
        execution_task_id: &str,
        summary: BatchSummary,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_task_execution_history
            SET status = ?, total_hosts = ?, completed_hosts = ?, failed_hosts = ?, finished_at = ?
            WHERE execution_task_id = ?
            "#,
        )
        .bind(summary.status.as_str())
        .bind(i64::from(summary.total_hosts))
        .bind(i64::from(summary.completed_hosts))
        .bind(i64::from(summary.failed_hosts))
        .bind(Utc::now().timestamp())
        .bind(execution_task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!(
            "Failed to finalize history for execution '{}'",
            execution_task_id
        )))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_host_executions(
        &self,
        execution_task_id: &str,
        executions: &[VerificationExecution],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to open execution transaction"))?;

        for execution in executions {
            sqlx::query(
                r#"
                INSERT INTO verification_executions (
                    execution_task_id, host_ip, status, started_at, finished_at, exit_code,
                    stdout_log, stderr_log, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(execution_task_id, host_ip) DO UPDATE SET
                    status = excluded.status,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at,
                    exit_code = excluded.exit_code,
                    stdout_log = excluded.stdout_log,
                    stderr_log = excluded.stderr_log,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(execution_task_id)
            .bind(&execution.host_ip)
            .bind(execution.status.as_str())
            .bind(execution.started_at.map(|v| v.timestamp()))
            .bind(execution.finished_at.map(|v| v.timestamp()))
            .bind(execution.exit_code.map(i64::from))
            .bind(&execution.stdout_log)
            .bind(&execution.stderr_log)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err(format!(
                "Failed to record execution of '{}' for '{}'",
                execution.host_ip, execution_task_id
            )))?;
        }

        tx.commit()
            .await
            .map_err(db_err("Failed to commit execution records"))?;
        Ok(())
    }
}

fn db_err<C: Display>(context: C) -> impl FnOnce(sqlx::Error) -> EngineError {
    move |e| EngineError::Persistence(format!("{}: {}", context, e))
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    Ok(value.clamp(0, i64::from(u32::MAX)) as u32)
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

fn trim_to_option(input: String) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
