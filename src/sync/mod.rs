use crate::config::SyncConfig;
use crate::datasource::{AdapterFactory, DataSourceAdapter, HostMetrics, QueryOutcome};
use crate::error::{EngineError, Result};
use crate::scheduler::{task_id_of, TriggerJob};
use crate::task_manager::contracts::{
    ExecutionLogStore, HostDirectory, InventoryStore, TaskConfigStore,
};
use crate::task_manager::models::{
    parse_query_window, DetailStatus, NewSyncDetail, RunFinalization, SyncRunStatus, SyncTask,
};
use crate::task_manager::EngineStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Persistence and directory collaborators of a sync run.
#[derive(Clone)]
pub struct SyncCollaborators {
    pub tasks: Arc<dyn TaskConfigStore>,
    pub hosts: Arc<dyn HostDirectory>,
    pub inventory: Arc<dyn InventoryStore>,
    pub history: Arc<dyn ExecutionLogStore>,
}

impl SyncCollaborators {
    pub fn from_store(store: Arc<EngineStore>) -> Self {
        Self {
            tasks: store.clone(),
            hosts: store.clone(),
            inventory: store.clone(),
            history: store,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TaskNotFound,
    Disabled,
    NoActiveHosts,
    AlreadyRunning,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskNotFound => "task not found",
            Self::Disabled => "task disabled or deleted",
            Self::NoActiveHosts => "no active hosts",
            Self::AlreadyRunning => "previous run still in progress",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunReport {
    pub run_id: String,
    pub status: SyncRunStatus,
    pub summary: String,
    pub total_hosts: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub not_in_source_count: u32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRunOutcome {
    Skipped(SkipReason),
    Completed(SyncRunReport),
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    success: u32,
    failed: u32,
    not_in_source: u32,
}

impl RunCounters {
    fn record(&mut self, status: DetailStatus) {
        match status {
            DetailStatus::Success => self.success += 1,
            DetailStatus::Failed => self.failed += 1,
            DetailStatus::NotInSource => self.not_in_source += 1,
        }
    }
}

/// Marks a task as running for as long as it is held.
struct InFlightGuard {
    running: Arc<StdMutex<HashSet<String>>>,
    task_id: String,
}

impl InFlightGuard {
    fn acquire(running: &Arc<StdMutex<HashSet<String>>>, task_id: &str) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(task_id.to_string()) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.running.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.task_id);
    }
}

/// Runs one synchronization pass of a task across the active host universe.
pub struct SyncOrchestrator {
    stores: SyncCollaborators,
    adapters: Arc<dyn AdapterFactory>,
    max_concurrency: usize,
    adapter_timeout: Duration,
    default_window: Duration,
    running: Arc<StdMutex<HashSet<String>>>,
}

impl SyncOrchestrator {
    pub fn new(
        stores: SyncCollaborators,
        adapters: Arc<dyn AdapterFactory>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let default_window = parse_query_window(&config.default_window)
            .map_err(|e| EngineError::Config(format!("sync.defaultWindow: {}", e)))?;

        Ok(Self {
            stores,
            adapters,
            max_concurrency: config.max_concurrency.max(1),
            adapter_timeout: config.adapter_timeout(),
            default_window: Duration::from_secs(default_window),
            running: Arc::new(StdMutex::new(HashSet::new())),
        })
    }

    pub async fn run_once(&self, task_id: &str) -> Result<SyncRunOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.running, task_id) else {
            log::warn!(
                "Skipping sync task '{}': previous run still in progress",
                task_id
            );
            return Ok(SyncRunOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let task = match self.stores.tasks.get_sync_task(task_id).await? {
            Some(task) => task,
            None => return Ok(self.skip(task_id, SkipReason::TaskNotFound)),
        };
        if !task.is_runnable() {
            return Ok(self.skip(task_id, SkipReason::Disabled));
        }

        let hosts = self.stores.hosts.list_active_host_ips().await?;
        if hosts.is_empty() {
            return Ok(self.skip(task_id, SkipReason::NoActiveHosts));
        }

        let adapter = self.adapters.adapter_for(&task)?;
        let window = self.window_for(&task);
        let total_hosts = hosts.len() as u32;
        let started_at = Utc::now();
        let clock = Instant::now();

        let run_id = self
            .stores
            .history
            .create_run(&task, started_at, total_hosts)
            .await?;
        log::info!(
            "Sync run {} started for task '{}' ({}) over {} hosts",
            run_id,
            task.name,
            adapter.kind().as_str(),
            total_hosts
        );

        let counters = self.fan_out(&run_id, hosts, adapter, window).await;

        let duration_ms = clock.elapsed().as_millis() as i64;
        let status =
            SyncRunStatus::from_counts(counters.success, counters.failed, counters.not_in_source);
        let finalization = RunFinalization {
            status,
            success_count: counters.success,
            failed_count: counters.failed,
            not_in_source_count: counters.not_in_source,
            duration_ms,
        };
        if let Err(e) = self.stores.history.finalize_run(&run_id, finalization).await {
            log::error!("Failed to finalize sync run {}: {}", run_id, e);
            return Err(e);
        }

        let summary = format!(
            "Synced {} hosts in {} ms: {} succeeded, {} failed, {} not in source",
            total_hosts,
            duration_ms,
            counters.success,
            counters.failed,
            counters.not_in_source
        );
        log::info!(
            "Sync run {} finished as {}: {}",
            run_id,
            status.as_str(),
            summary
        );

        Ok(SyncRunOutcome::Completed(SyncRunReport {
            run_id,
            status,
            summary,
            total_hosts,
            success_count: counters.success,
            failed_count: counters.failed,
            not_in_source_count: counters.not_in_source,
            duration_ms,
        }))
    }

    fn skip(&self, task_id: &str, reason: SkipReason) -> SyncRunOutcome {
        log::info!("Skipping sync task '{}': {}", task_id, reason.as_str());
        SyncRunOutcome::Skipped(reason)
    }

    fn window_for(&self, task: &SyncTask) -> Duration {
        if task.query_window.trim().is_empty() {
            return self.default_window;
        }
        match parse_query_window(&task.query_window) {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                log::warn!(
                    "Task '{}' has an unusable query window, using default: {}",
                    task.id,
                    e
                );
                self.default_window
            }
        }
    }

    /// Processes every host, waiting for all of them; no host failure stops
    /// the others. Sources with a batch API are queried one chunk per permit.
    async fn fan_out(
        &self,
        run_id: &str,
        hosts: Vec<String>,
        adapter: Arc<dyn DataSourceAdapter>,
        window: Duration,
    ) -> RunCounters {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let counters = Arc::new(Mutex::new(RunCounters::default()));
        let batch_size = adapter.batch_size();
        let worker = Arc::new(HostWorker {
            run_id: run_id.to_string(),
            adapter,
            inventory: self.stores.inventory.clone(),
            history: self.stores.history.clone(),
            window,
            timeout: self.adapter_timeout,
            batched: batch_size.is_some(),
        });

        let (sizes, handles): (Vec<usize>, Vec<_>) = hosts
            .chunks(batch_size.unwrap_or(1).max(1))
            .map(|chunk| {
                let ips = chunk.to_vec();
                let worker = worker.clone();
                let permits = permits.clone();
                let counters = counters.clone();
                let handle = tokio::spawn(async move {
                    let statuses = match permits.acquire_owned().await {
                        Ok(_permit) => worker.process(&ips).await,
                        Err(_) => worker.fail_all(&ips, "worker pool closed").await,
                    };
                    let mut totals = counters.lock().await;
                    for status in statuses {
                        totals.record(status);
                    }
                });
                (chunk.len(), handle)
            })
            .unzip();

        let results = futures::future::join_all(handles).await;
        for (size, result) in sizes.into_iter().zip(results) {
            if let Err(e) = result {
                log::error!("Sync worker for run {} aborted: {}", run_id, e);
                let mut totals = counters.lock().await;
                for _ in 0..size {
                    totals.record(DetailStatus::Failed);
                }
            }
        }

        // Copied out so the guard is released before `counters` is dropped.
        let totals = *counters.lock().await;
        totals
    }
}

/// Adapter answer for one host, with the error already rendered to text so a
/// failed batch can be reported on every host it covered.
type Queried = std::result::Result<QueryOutcome, String>;

struct HostWorker {
    run_id: String,
    adapter: Arc<dyn DataSourceAdapter>,
    inventory: Arc<dyn InventoryStore>,
    history: Arc<dyn ExecutionLogStore>,
    window: Duration,
    timeout: Duration,
    batched: bool,
}

impl HostWorker {
    async fn process(&self, ips: &[String]) -> Vec<DetailStatus> {
        let queried = if self.batched {
            self.query_chunk(ips).await
        } else {
            let mut out = Vec::with_capacity(ips.len());
            for ip in ips {
                out.push((ip.clone(), self.query_one(ip).await));
            }
            out
        };

        let mut statuses = Vec::with_capacity(queried.len());
        for (ip, outcome) in queried {
            statuses.push(self.settle(&ip, outcome).await);
        }
        statuses
    }

    fn timed_out(&self) -> String {
        EngineError::AdapterTransient(format!("Query timed out after {:?}", self.timeout))
            .to_string()
    }

    async fn query_one(&self, ip: &str) -> Queried {
        let query = self.adapter.query_host_metrics(ip, self.window);
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// One batch call for the whole chunk. Hosts missing from the answer are
    /// not in the source; a failed call fails every host of the chunk.
    async fn query_chunk(&self, ips: &[String]) -> Vec<(String, Queried)> {
        let query = self.adapter.query_batch(ips, self.window);
        let answered = match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(self.timed_out()),
        };

        match answered {
            Ok(mut found) => ips
                .iter()
                .map(|ip| {
                    let outcome = found.remove(ip).unwrap_or(QueryOutcome::NoData);
                    (ip.clone(), Ok(outcome))
                })
                .collect(),
            Err(message) => ips
                .iter()
                .map(|ip| (ip.clone(), Err(message.clone())))
                .collect(),
        }
    }

    async fn settle(&self, ip: &str, queried: Queried) -> DetailStatus {
        match queried {
            Ok(QueryOutcome::NoData) => {
                self.record(ip, DetailStatus::NotInSource, None, None, None).await;
                DetailStatus::NotInSource
            }
            Err(message) => {
                log::warn!("Host {} failed in run {}: {}", ip, self.run_id, message);
                self.record(ip, DetailStatus::Failed, None, Some(message), None).await;
                DetailStatus::Failed
            }
            Ok(QueryOutcome::Found(metrics)) => match self.reconcile(ip, &metrics).await {
                Ok(host_name) => {
                    self.record(
                        ip,
                        DetailStatus::Success,
                        Some(host_name),
                        None,
                        Some(metrics.snapshot()),
                    )
                    .await;
                    DetailStatus::Success
                }
                Err(e) => {
                    log::warn!(
                        "Reconciling host {} failed in run {}: {}",
                        ip,
                        self.run_id,
                        e
                    );
                    self.record(
                        ip,
                        DetailStatus::Failed,
                        metrics.host_name().map(str::to_string),
                        Some(e.to_string()),
                        Some(metrics.snapshot()),
                    )
                    .await;
                    DetailStatus::Failed
                }
            },
        }
    }

    async fn fail_all(&self, ips: &[String], reason: &str) -> Vec<DetailStatus> {
        for ip in ips {
            self.record(ip, DetailStatus::Failed, None, Some(reason.to_string()), None).await;
        }
        vec![DetailStatus::Failed; ips.len()]
    }

    /// Resolves (or lazily creates) the inventory host and writes the metrics.
    /// Returns the host's inventory name.
    async fn reconcile(&self, ip: &str, metrics: &HostMetrics) -> Result<String> {
        let (host_id, host_name) = match self.inventory.find_by_ip(ip).await? {
            Some(host) => (host.id, host.name),
            None => {
                let name = metrics.host_name().unwrap_or(ip).to_string();
                let id = self.inventory.insert_if_absent(&name, ip).await?;
                log::info!("Added unknown host {} ({}) to inventory", ip, name);
                (id, name)
            }
        };

        self.inventory
            .upsert_metrics(host_id, ip, &metrics.to_upsert())
            .await?;
        Ok(host_name)
    }

    async fn record(
        &self,
        ip: &str,
        status: DetailStatus,
        host_name: Option<String>,
        error_message: Option<String>,
        metric_snapshot: Option<serde_json::Value>,
    ) {
        let detail = NewSyncDetail {
            run_id: self.run_id.clone(),
            host_ip: ip.to_string(),
            host_name,
            status,
            error_message,
            metric_snapshot,
        };
        if let Err(e) = self.history.append_detail(detail).await {
            log::warn!(
                "Failed to record {} detail for host {} in run {}: {}",
                status.as_str(),
                ip,
                self.run_id,
                e
            );
        }
    }
}

/// Trigger entry point for sync tasks.
pub struct SyncTrigger {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncTrigger {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TriggerJob for SyncTrigger {
    async fn fire(
        &self,
        key: &str,
        _fired_at: DateTime<Utc>,
        _next_fire_at: Option<DateTime<Utc>>,
    ) {
        let task_id = task_id_of(key);
        if let Err(e) = self.orchestrator.run_once(task_id).await {
            log::error!("Sync task '{}' failed: {}", task_id, e);
        }
    }
}
