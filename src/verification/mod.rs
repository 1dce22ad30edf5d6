//! Hardware-stress verification: submission to the remote execution service
//! and the per-batch poll monitor that resolves it.

pub mod scheduled;

use crate::config::VerificationConfig;
use crate::error::{EngineError, Result};
use crate::task_manager::contracts::{
    SubmissionReceipt, VerificationHistoryStore, VerificationService,
};
use crate::task_manager::models::{
    BatchSummary, HistoryStatus, VerificationExecution, VerificationRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use scheduled::{FireOutcome, ScheduledVerificationTrigger};

const SUBMIT_PATH: &str = "/api/v1/verifications";

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    host_ips: &'a [String],
    resource_type: &'a str,
    target_percent: u8,
    duration_secs: u64,
    force: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    execution_task_id: String,
    #[serde(default)]
    accepted_hosts: u32,
    #[serde(default)]
    rejected_hosts: u32,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StatusResponse {
    #[serde(default)]
    executions: Vec<VerificationExecution>,
}

/// REST client of the remote execution service.
pub struct HttpVerificationService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerificationService {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VerificationService for HttpVerificationService {
    async fn submit(&self, request: &VerificationRequest) -> Result<SubmissionReceipt> {
        let body = SubmitBody {
            host_ips: &request.host_ips,
            resource_type: request.resource_type.as_str(),
            target_percent: request.target_percent,
            duration_secs: request.duration_secs,
            force: request.force,
        };

        let response = self
            .client
            .post(format!("{}{}", self.endpoint, SUBMIT_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EngineError::SubmissionRejected(format!("Execution service unreachable: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(256).collect();
            return Err(EngineError::SubmissionRejected(format!(
                "Execution service answered {}: {}",
                status,
                text.trim()
            )));
        }

        let parsed: SubmitResponse = response.json().await.map_err(|e| {
            EngineError::SubmissionRejected(format!("Unreadable submission response: {}", e))
        })?;

        Ok(SubmissionReceipt {
            execution_task_id: parsed.execution_task_id,
            accepted_hosts: parsed.accepted_hosts,
            rejected_hosts: parsed.rejected_hosts,
            message: parsed.message,
        })
    }

    async fn query_status(&self, execution_task_id: &str) -> Result<Vec<VerificationExecution>> {
        let response = self
            .client
            .get(format!("{}{}/{}", self.endpoint, SUBMIT_PATH, execution_task_id))
            .send()
            .await
            .map_err(|e| EngineError::AdapterTransient(format!("Status query failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::AdapterTransient(format!(
                "Status query for '{}' answered {}",
                execution_task_id, status
            )));
        }

        let parsed: StatusResponse = response.json().await.map_err(|e| {
            EngineError::AdapterTransient(format!("Unreadable status response: {}", e))
        })?;
        Ok(parsed.executions)
    }
}

/// Timing of the poll monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub ceiling: Duration,
}

impl From<&VerificationConfig> for PollSettings {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.poll_interval_secs),
            ceiling: Duration::from_secs(config.ceiling_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(BatchSummary),
    /// The ceiling elapsed before every host was terminal.
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub execution_task_id: String,
    pub accepted_hosts: u32,
    pub rejected_hosts: u32,
    pub message: String,
    /// Detached poll monitor; dropping the handle does not stop it.
    pub monitor: JoinHandle<PollOutcome>,
}

impl SubmissionOutcome {
    pub fn accepted(&self) -> bool {
        self.accepted_hosts > 0
    }
}

pub struct VerificationOrchestrator {
    service: Arc<dyn VerificationService>,
    history: Arc<dyn VerificationHistoryStore>,
    settings: PollSettings,
    shutdown: CancellationToken,
}

impl VerificationOrchestrator {
    pub fn new(
        service: Arc<dyn VerificationService>,
        history: Arc<dyn VerificationHistoryStore>,
        settings: PollSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            history,
            settings,
            shutdown,
        }
    }

    /// Submits an ad-hoc batch and starts its monitor.
    pub async fn submit(&self, request: &VerificationRequest) -> Result<SubmissionOutcome> {
        self.submit_correlated(request, None).await
    }

    /// Submits a batch owned by a scheduled firing. The history row is
    /// correlated with the execution-task id before the monitor starts, so the
    /// monitor can always find it.
    pub async fn submit_for_history(
        &self,
        request: &VerificationRequest,
        history_id: i64,
    ) -> Result<SubmissionOutcome> {
        self.submit_correlated(request, Some(history_id)).await
    }

    async fn submit_correlated(
        &self,
        request: &VerificationRequest,
        history_id: Option<i64>,
    ) -> Result<SubmissionOutcome> {
        request.validate()?;

        let receipt = self.service.submit(request).await?;
        if receipt.execution_task_id.trim().is_empty() {
            return Err(EngineError::SubmissionRejected(
                "Execution service returned no execution-task id".to_string(),
            ));
        }
        if receipt.accepted_hosts == 0 {
            return Err(EngineError::SubmissionRejected(
                receipt
                    .message
                    .clone()
                    .unwrap_or_else(|| "No host accepted the verification".to_string()),
            ));
        }

        let message = receipt.message.clone().unwrap_or_else(|| {
            format!(
                "{} hosts accepted, {} rejected",
                receipt.accepted_hosts, receipt.rejected_hosts
            )
        });

        if let Some(history_id) = history_id {
            let status = if receipt.rejected_hosts == 0 {
                HistoryStatus::Success
            } else {
                HistoryStatus::Partial
            };
            if let Err(e) = self
                .history
                .mark_history_submitted(
                    history_id,
                    &receipt.execution_task_id,
                    status,
                    Some(&message),
                )
                .await
            {
                log::error!(
                    "Failed to correlate history {} with execution '{}': {}",
                    history_id,
                    receipt.execution_task_id,
                    e
                );
            }
        }

        log::info!(
            "Verification '{}' submitted: {}",
            receipt.execution_task_id,
            message
        );

        let monitor = tokio::spawn(poll_until_terminal(
            self.service.clone(),
            self.history.clone(),
            receipt.execution_task_id.clone(),
            self.settings,
            self.shutdown.child_token(),
        ));

        Ok(SubmissionOutcome {
            execution_task_id: receipt.execution_task_id,
            accepted_hosts: receipt.accepted_hosts,
            rejected_hosts: receipt.rejected_hosts,
            message,
            monitor,
        })
    }
}

/// Returns `false` when cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn poll_until_terminal(
    service: Arc<dyn VerificationService>,
    history: Arc<dyn VerificationHistoryStore>,
    execution_task_id: String,
    settings: PollSettings,
    cancel: CancellationToken,
) -> PollOutcome {
    let deadline = Instant::now() + settings.ceiling;

    if !sleep_or_cancel(settings.initial_delay.min(settings.ceiling), &cancel).await {
        return PollOutcome::Cancelled;
    }

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let polled = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            polled = tokio::time::timeout(
                remaining.max(Duration::from_millis(1)),
                service.query_status(&execution_task_id),
            ) => polled,
        };

        match polled {
            Ok(Ok(executions)) => {
                if !executions.is_empty() {
                    if let Err(e) = history
                        .record_host_executions(&execution_task_id, &executions)
                        .await
                    {
                        log::warn!(
                            "Failed to record host progress for '{}': {}",
                            execution_task_id,
                            e
                        );
                    }
                }

                if let Some(summary) = BatchSummary::from_executions(&executions) {
                    match history.finalize_history(&execution_task_id, summary).await {
                        Ok(true) => {}
                        Ok(false) => log::debug!(
                            "Verification '{}' has no scheduled history row",
                            execution_task_id
                        ),
                        Err(e) => log::error!(
                            "Failed to finalize history for '{}': {}",
                            execution_task_id,
                            e
                        ),
                    }
                    log::info!(
                        "Verification '{}' finished as {}: {}/{} hosts completed",
                        execution_task_id,
                        summary.status.as_str(),
                        summary.completed_hosts,
                        summary.total_hosts
                    );
                    return PollOutcome::Completed(summary);
                }
            }
            Ok(Err(e)) => log::warn!(
                "Polling verification '{}' failed, retrying: {}",
                execution_task_id,
                e
            ),
            Err(_) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if !sleep_or_cancel(settings.interval.min(remaining), &cancel).await {
            return PollOutcome::Cancelled;
        }
    }

    let abandoned = EngineError::PollTimeout {
        execution_task_id: execution_task_id.clone(),
        ceiling: settings.ceiling,
    };
    log::error!("Abandoning verification monitor: {}", abandoned);
    PollOutcome::TimedOut
}

#[cfg(test)]
mod tests;
