use super::VerificationOrchestrator;
use crate::error::Result;
use crate::scheduler::{task_id_of, TriggerJob};
use crate::task_manager::contracts::VerificationHistoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The task vanished or was disabled since it was registered.
    Skipped,
    Submitted {
        history_id: i64,
        execution_task_id: String,
    },
    Rejected {
        history_id: i64,
        message: String,
    },
}

/// Fires recurring verification tasks.
pub struct ScheduledVerificationTrigger {
    store: Arc<dyn VerificationHistoryStore>,
    orchestrator: Arc<VerificationOrchestrator>,
}

impl ScheduledVerificationTrigger {
    pub fn new(
        store: Arc<dyn VerificationHistoryStore>,
        orchestrator: Arc<VerificationOrchestrator>,
    ) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Reads the task fresh, writes its history row, submits the batch and
    /// records the fire times.
    pub async fn fire_task(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<FireOutcome> {
        let task = match self.store.get_scheduled_verification(task_id).await? {
            Some(task) if task.is_runnable() => task,
            _ => {
                log::info!("Skipping scheduled verification '{}': not runnable", task_id);
                return Ok(FireOutcome::Skipped);
            }
        };

        let request = task.to_request();
        let history_id = self
            .store
            .create_history(&task.id, fired_at, request.host_ips.len() as u32)
            .await?;

        let outcome = match self
            .orchestrator
            .submit_for_history(&request, history_id)
            .await
        {
            Ok(submission) => FireOutcome::Submitted {
                history_id,
                execution_task_id: submission.execution_task_id,
            },
            Err(e) => {
                let message = e.to_string();
                log::error!(
                    "Scheduled verification '{}' ({}) was not submitted: {}",
                    task.name,
                    task.id,
                    message
                );
                if let Err(write_err) = self
                    .store
                    .mark_history_rejected(history_id, &message)
                    .await
                {
                    log::error!(
                        "Failed to record rejection on history {}: {}",
                        history_id,
                        write_err
                    );
                }
                FireOutcome::Rejected {
                    history_id,
                    message,
                }
            }
        };

        if let Err(e) = self
            .store
            .record_fire_times(&task.id, fired_at, next_fire_at)
            .await
        {
            log::warn!("Failed to record fire times for '{}': {}", task.id, e);
        }

        Ok(outcome)
    }
}

#[async_trait]
impl TriggerJob for ScheduledVerificationTrigger {
    async fn fire(
        &self,
        key: &str,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) {
        let task_id = task_id_of(key);
        if let Err(e) = self.fire_task(task_id, fired_at, next_fire_at).await {
            log::error!("Scheduled verification '{}' failed: {}", task_id, e);
        }
    }
}

#[cfg(test)]
mod tests;
