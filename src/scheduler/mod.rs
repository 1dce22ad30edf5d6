use crate::error::{EngineError, Result};
use crate::task_manager::cron::CronSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SYNC_KEY_PREFIX: &str = "sync:";
const VERIFICATION_KEY_PREFIX: &str = "verify:";

/// Registry key of a sync task. Sync and verification tasks share one
/// registry, so keys are namespaced by task kind.
pub fn sync_key(task_id: &str) -> String {
    format!("{}{}", SYNC_KEY_PREFIX, task_id)
}

pub fn verification_key(task_id: &str) -> String {
    format!("{}{}", VERIFICATION_KEY_PREFIX, task_id)
}

/// Task id behind a registry key; plain ids pass through unchanged.
pub fn task_id_of(key: &str) -> &str {
    key.strip_prefix(SYNC_KEY_PREFIX)
        .or_else(|| key.strip_prefix(VERIFICATION_KEY_PREFIX))
        .unwrap_or(key)
}

/// Work invoked each time a registered trigger fires.
#[async_trait]
pub trait TriggerJob: Send + Sync {
    async fn fire(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    );
}

struct Registration {
    expression: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live mapping of task id to its periodic trigger.
///
/// Owned by the engine; every trigger is a child of the shutdown token passed
/// in, so cancelling that token stops all future firings. Firings already
/// running are tracked and [`SchedulerRegistry::shutdown`] waits for them.
pub struct SchedulerRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    shutdown: CancellationToken,
    firings: TaskTracker,
}

impl SchedulerRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shutdown,
            firings: TaskTracker::new(),
        }
    }

    /// Schedules `job` under `task_id`, replacing any existing trigger.
    ///
    /// The expression is parsed before the map is touched, so a malformed
    /// expression leaves the registry exactly as it was.
    pub async fn register(
        &self,
        task_id: &str,
        expression: &str,
        job: Arc<dyn TriggerJob>,
    ) -> Result<()> {
        let schedule = CronSchedule::parse(expression).map_err(|e| {
            log::error!("Refusing to schedule task '{}': {}", task_id, e);
            e
        })?;
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Registration(format!(
                "Scheduler is shut down; task '{}' not scheduled",
                task_id
            )));
        }

        let mut entries = self.entries.write().await;
        if let Some(previous) = entries.remove(task_id) {
            previous.cancel.cancel();
            log::debug!(
                "Replaced trigger '{}' for task '{}'",
                previous.expression,
                task_id
            );
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_trigger(
            task_id.to_string(),
            schedule,
            job,
            cancel.clone(),
            self.firings.clone(),
        ));
        entries.insert(
            task_id.to_string(),
            Registration {
                expression: expression.trim().to_string(),
                cancel,
                handle,
            },
        );

        log::info!("Registered task '{}' with trigger '{}'", task_id, expression.trim());
        Ok(())
    }

    /// Returns whether a trigger was removed.
    pub async fn unregister(&self, task_id: &str) -> bool {
        let removed = self.entries.write().await.remove(task_id);
        match removed {
            Some(registration) => {
                registration.cancel.cancel();
                log::info!("Unregistered task '{}'", task_id);
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, task_id: &str) -> bool {
        self.entries.read().await.contains_key(task_id)
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn expression_of(&self, task_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(task_id)
            .map(|r| r.expression.clone())
    }

    /// Stops every trigger, then waits for the trigger loops and for every
    /// firing still in progress.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, Registration)> = self.entries.write().await.drain().collect();
        for (task_id, registration) in drained {
            registration.cancel.cancel();
            if let Err(e) = registration.handle.await {
                log::warn!("Trigger loop for task '{}' ended abnormally: {}", task_id, e);
            }
        }

        // No loop is left to spawn firings, so closing cannot race a new one.
        self.firings.close();
        if !self.firings.is_empty() {
            log::info!(
                "Waiting for {} in-flight firings to finish",
                self.firings.len()
            );
        }
        self.firings.wait().await;
        log::info!("Scheduler registry stopped");
    }
}

async fn run_trigger(
    task_id: String,
    schedule: CronSchedule,
    job: Arc<dyn TriggerJob>,
    cancel: CancellationToken,
    firings: TaskTracker,
) {
    // Never fire the same instant twice even if the timer wakes early.
    let mut cursor = Utc::now();

    loop {
        let now = Utc::now();
        let Some(fire_at) = schedule.next_after(cursor.max(now)) else {
            log::warn!(
                "Trigger '{}' for task '{}' has no future fire time",
                schedule.expression(),
                task_id
            );
            return;
        };
        let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        cursor = fire_at;
        let next_fire_at = schedule.next_after(fire_at);
        let job = job.clone();
        let id = task_id.clone();
        firings.spawn(async move {
            job.fire(&id, fire_at, next_fire_at).await;
        });
    }
}

#[cfg(test)]
mod tests;
