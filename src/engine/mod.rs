//! Process-level wiring: builds the orchestrators around one store, keeps the
//! scheduler registry in step with persisted task configuration and owns the
//! shutdown token every background loop hangs off.

use crate::config::EngineConfig;
use crate::datasource::{AdapterFactory, HttpAdapterFactory};
use crate::error::Result;
use crate::scheduler::{sync_key, verification_key, SchedulerRegistry, TriggerJob};
use crate::sync::{SyncCollaborators, SyncOrchestrator, SyncRunOutcome, SyncTrigger};
use crate::task_manager::contracts::{
    TaskConfigStore, VerificationHistoryStore, VerificationService,
};
use crate::task_manager::models::{ScheduledVerificationTask, SyncTask, VerificationRequest};
use crate::task_manager::EngineStore;
use crate::verification::{
    HttpVerificationService, PollSettings, ScheduledVerificationTrigger, SubmissionOutcome,
    VerificationOrchestrator,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one reconciliation pass changed in the registry.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub registered: usize,
    pub replaced: usize,
    pub unregistered: usize,
    pub failed: usize,
}

enum TaskKind {
    Sync,
    Verification,
}

pub struct Engine {
    store: Arc<EngineStore>,
    registry: Arc<SchedulerRegistry>,
    sync: Arc<SyncOrchestrator>,
    verification: Arc<VerificationOrchestrator>,
    sync_trigger: Arc<dyn TriggerJob>,
    verification_trigger: Arc<dyn TriggerJob>,
    reconcile_interval: Duration,
    shutdown: CancellationToken,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Builds an engine talking to the HTTP data sources and execution service
    /// named in `config`.
    pub fn new(config: EngineConfig, store: Arc<EngineStore>) -> Result<Self> {
        let config = Arc::new(config);
        let adapters = Arc::new(HttpAdapterFactory::new(config.clone())?);
        let service = Arc::new(HttpVerificationService::new(&config.verification)?);
        Self::with_collaborators(&config, store, adapters, service)
    }

    pub fn with_collaborators(
        config: &EngineConfig,
        store: Arc<EngineStore>,
        adapters: Arc<dyn AdapterFactory>,
        service: Arc<dyn VerificationService>,
    ) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let sync = Arc::new(SyncOrchestrator::new(
            SyncCollaborators::from_store(store.clone()),
            adapters,
            &config.sync,
        )?);
        let verification = Arc::new(VerificationOrchestrator::new(
            service,
            store.clone(),
            PollSettings::from(&config.verification),
            shutdown.clone(),
        ));

        Ok(Self {
            registry: Arc::new(SchedulerRegistry::new(shutdown.clone())),
            sync_trigger: Arc::new(SyncTrigger::new(sync.clone())),
            verification_trigger: Arc::new(ScheduledVerificationTrigger::new(
                store.clone(),
                verification.clone(),
            )),
            store,
            sync,
            verification,
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
            shutdown,
            reconciler: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<EngineStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    /// Registers every enabled task and starts the periodic reconciliation loop.
    pub async fn start(&self) -> Result<ReconcileReport> {
        let report = self.reconcile().await?;
        log::info!(
            "Engine started: {} tasks scheduled, {} rejected",
            self.registry.count().await,
            report.failed
        );

        let mut slot = self.reconciler.lock().await;
        if slot.is_none() {
            *slot = Some(self.spawn_reconciler());
        }
        Ok(report)
    }

    fn spawn_reconciler(&self) -> JoinHandle<()> {
        let engine = self.context();
        let interval = self.reconcile_interval;
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match engine.reconcile().await {
                    Ok(report) if report != ReconcileReport::default() => {
                        log::info!("Reconciled schedules: {:?}", report)
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Schedule reconciliation failed: {}", e),
                }
            }
            log::debug!("Reconciliation loop stopped");
        })
    }

    /// Brings the registry in line with the enabled tasks in storage.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.context().reconcile().await
    }

    pub async fn register_sync_task(&self, task: &SyncTask) -> Result<()> {
        self.registry
            .register(
                &sync_key(&task.id),
                &task.cron_expression,
                self.sync_trigger.clone(),
            )
            .await
    }

    pub async fn unregister_sync_task(&self, task_id: &str) -> bool {
        self.registry.unregister(&sync_key(task_id)).await
    }

    pub async fn register_scheduled_verification(
        &self,
        task: &ScheduledVerificationTask,
    ) -> Result<()> {
        self.registry
            .register(
                &verification_key(&task.id),
                &task.cron_expression,
                self.verification_trigger.clone(),
            )
            .await
    }

    pub async fn unregister_scheduled_verification(&self, task_id: &str) -> bool {
        self.registry.unregister(&verification_key(task_id)).await
    }

    /// Looks up a raw registry key such as `sync:{id}`.
    pub async fn is_registered(&self, key: &str) -> bool {
        self.registry.is_registered(key).await
    }

    pub async fn is_sync_task_registered(&self, task_id: &str) -> bool {
        self.registry.is_registered(&sync_key(task_id)).await
    }

    pub async fn is_scheduled_verification_registered(&self, task_id: &str) -> bool {
        self.registry.is_registered(&verification_key(task_id)).await
    }

    pub async fn registered_count(&self) -> usize {
        self.registry.count().await
    }

    /// Runs a sync task immediately, outside its schedule.
    pub async fn run_sync_now(&self, task_id: &str) -> Result<SyncRunOutcome> {
        self.sync.run_once(task_id).await
    }

    /// Submits an ad-hoc verification batch.
    pub async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<SubmissionOutcome> {
        self.verification.submit(request).await
    }

    /// Stops the reconciliation loop, every trigger and every poll monitor,
    /// then waits for firings already in progress to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.reconciler.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("Reconciliation loop ended abnormally: {}", e);
            }
        }
        self.registry.shutdown().await;
        log::info!("Engine stopped");
    }

    fn context(&self) -> ReconcileContext {
        ReconcileContext {
            store: self.store.clone(),
            registry: self.registry.clone(),
            sync_trigger: self.sync_trigger.clone(),
            verification_trigger: self.verification_trigger.clone(),
        }
    }
}

/// The pieces of the engine the background reconciliation loop needs.
struct ReconcileContext {
    store: Arc<EngineStore>,
    registry: Arc<SchedulerRegistry>,
    sync_trigger: Arc<dyn TriggerJob>,
    verification_trigger: Arc<dyn TriggerJob>,
}

impl ReconcileContext {
    async fn reconcile(&self) -> Result<ReconcileReport> {
        // Both listings must succeed before anything is unregistered.
        let sync_tasks = self.store.list_enabled_sync_tasks(None).await?;
        let verifications = self.store.list_enabled_scheduled_verifications().await?;

        let mut desired: HashMap<String, (String, TaskKind)> = HashMap::new();
        for task in sync_tasks {
            desired.insert(sync_key(&task.id), (task.cron_expression, TaskKind::Sync));
        }
        for task in verifications {
            desired.insert(
                verification_key(&task.id),
                (task.cron_expression, TaskKind::Verification),
            );
        }

        let mut report = ReconcileReport::default();

        for key in self.registry.registered_ids().await {
            if !desired.contains_key(&key) && self.registry.unregister(&key).await {
                report.unregistered += 1;
            }
        }

        for (key, (expression, kind)) in &desired {
            let current = self.registry.expression_of(key).await;
            if current.as_deref() == Some(expression.trim()) {
                continue;
            }

            let job = match kind {
                TaskKind::Sync => self.sync_trigger.clone(),
                TaskKind::Verification => self.verification_trigger.clone(),
            };
            match self.registry.register(key, expression, job).await {
                Ok(()) if current.is_some() => report.replaced += 1,
                Ok(()) => report.registered += 1,
                Err(e) => {
                    log::error!("Task '{}' left unscheduled: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
