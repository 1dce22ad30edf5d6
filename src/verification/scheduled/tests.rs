use super::*;
use crate::error::EngineError;
use crate::task_manager::contracts::{SubmissionReceipt, VerificationService};
use crate::task_manager::models::{
    CreateScheduledVerificationRequest, ExecutionStatus, HistoryStatus, ResourceType,
    VerificationExecution, VerificationRequest,
};
use crate::task_manager::EngineStore;
use crate::verification::PollSettings;
use chrono::Duration as ChronoDuration;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct StubService {
    accept: bool,
    submitted: Mutex<Vec<VerificationRequest>>,
}

impl StubService {
    fn new(accept: bool) -> Self {
        Self {
            accept,
            submitted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VerificationService for StubService {
    async fn submit(&self, request: &VerificationRequest) -> Result<SubmissionReceipt> {
        self.submitted.lock().unwrap().push(request.clone());
        if !self.accept {
            return Err(EngineError::SubmissionRejected(
                "hosts locked by maintenance".to_string(),
            ));
        }
        Ok(SubmissionReceipt {
            execution_task_id: "exec-sched".to_string(),
            accepted_hosts: request.host_ips.len() as u32 - 1,
            rejected_hosts: 1,
            message: None,
        })
    }

    async fn query_status(&self, _execution_task_id: &str) -> Result<Vec<VerificationExecution>> {
        Ok(vec![
            VerificationExecution {
                host_ip: "10.1.0.1".to_string(),
                status: ExecutionStatus::Completed,
                started_at: None,
                finished_at: None,
                exit_code: Some(0),
                stdout_log: None,
                stderr_log: None,
            },
            VerificationExecution {
                host_ip: "10.1.0.2".to_string(),
                status: ExecutionStatus::Failed,
                started_at: None,
                finished_at: None,
                exit_code: Some(1),
                stdout_log: None,
                stderr_log: Some("stress-ng: not found".to_string()),
            },
        ])
    }
}

struct Fixture {
    store: Arc<EngineStore>,
    service: Arc<StubService>,
    trigger: ScheduledVerificationTrigger,
}

async fn fixture(accept: bool) -> Fixture {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(EngineStore::new(pool).await.unwrap());
    let service = Arc::new(StubService::new(accept));
    let orchestrator = Arc::new(VerificationOrchestrator::new(
        service.clone(),
        store.clone(),
        PollSettings {
            initial_delay: Duration::from_millis(5),
            interval: Duration::from_millis(10),
            ceiling: Duration::from_millis(200),
        },
        CancellationToken::new(),
    ));
    let trigger = ScheduledVerificationTrigger::new(store.clone(), orchestrator);
    Fixture {
        store,
        service,
        trigger,
    }
}

fn create_request() -> CreateScheduledVerificationRequest {
    CreateScheduledVerificationRequest {
        name: "weekly cpu burn".to_string(),
        cron_expression: "0 3 * * 0".to_string(),
        host_ips: vec![
            "10.1.0.1".to_string(),
            "10.1.0.2".to_string(),
            "10.1.0.3".to_string(),
        ],
        resource_type: ResourceType::Cpu,
        target_percent: 90,
        duration_secs: 600,
        force: true,
        enabled: true,
    }
}

#[tokio::test]
async fn firing_submits_and_correlates_history() {
    let fx = fixture(true).await;
    let task = fx
        .store
        .create_scheduled_verification(create_request())
        .await
        .unwrap();

    let fired_at = Utc::now();
    let next = fired_at + ChronoDuration::days(7);
    let outcome = fx
        .trigger
        .fire_task(&task.id, fired_at, Some(next))
        .await
        .unwrap();

    let FireOutcome::Submitted {
        history_id,
        execution_task_id,
    } = outcome
    else {
        panic!("expected submission, got {:?}", outcome);
    };
    assert_eq!(execution_task_id, "exec-sched");

    let submitted = fx.service.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].host_ips.len(), 3);
    assert!(submitted[0].force);

    let row = fx.store.get_history(history_id).await.unwrap().unwrap();
    assert_eq!(row.task_id, task.id);
    assert_eq!(row.execution_task_id.as_deref(), Some("exec-sched"));

    let stored = fx
        .store
        .get_scheduled_verification(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.last_fire_at.map(|t| t.timestamp()),
        Some(fired_at.timestamp())
    );
    assert_eq!(
        stored.next_fire_at.map(|t| t.timestamp()),
        Some(next.timestamp())
    );

    // The monitor resolves the batch shortly after.
    let mut finished = None;
    for _ in 0..50 {
        let row = fx.store.get_history(history_id).await.unwrap().unwrap();
        if row.finished_at.is_some() {
            finished = Some(row);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let finished = finished.expect("history was never finalized");
    assert_eq!(finished.status, HistoryStatus::Partial);
    assert_eq!(finished.completed_hosts, 1);
    assert_eq!(finished.failed_hosts, 1);
}

#[tokio::test]
async fn rejected_submission_is_recorded_as_failed_history() {
    let fx = fixture(false).await;
    let task = fx
        .store
        .create_scheduled_verification(create_request())
        .await
        .unwrap();

    let outcome = fx
        .trigger
        .fire_task(&task.id, Utc::now(), None)
        .await
        .unwrap();
    let FireOutcome::Rejected {
        history_id,
        message,
    } = outcome
    else {
        panic!("expected rejection, got {:?}", outcome);
    };
    assert!(message.contains("maintenance"), "{message}");

    let row = fx.store.get_history(history_id).await.unwrap().unwrap();
    assert_eq!(row.status, HistoryStatus::Failed);
    assert!(row.execution_task_id.is_none());
    assert!(row.finished_at.is_some());
    assert!(row.message.unwrap_or_default().contains("maintenance"));

    // Fire times are still recorded for rejected firings.
    let stored = fx
        .store
        .get_scheduled_verification(&task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.last_fire_at.is_some());
}

#[tokio::test]
async fn disabled_deleted_or_unknown_tasks_are_skipped() {
    let fx = fixture(true).await;
    let disabled = fx
        .store
        .create_scheduled_verification(create_request())
        .await
        .unwrap();
    fx.store
        .set_scheduled_verification_enabled(&disabled.id, false)
        .await
        .unwrap();
    let deleted = fx
        .store
        .create_scheduled_verification(create_request())
        .await
        .unwrap();
    fx.store
        .soft_delete_scheduled_verification(&deleted.id)
        .await
        .unwrap();

    for id in [disabled.id.as_str(), deleted.id.as_str(), "missing"] {
        let outcome = fx.trigger.fire_task(id, Utc::now(), None).await.unwrap();
        assert_eq!(outcome, FireOutcome::Skipped);
        assert!(fx.store.list_history(id).await.unwrap().is_empty());
    }
    assert!(fx.service.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn trigger_resolves_namespaced_keys() {
    let fx = fixture(true).await;
    let task = fx
        .store
        .create_scheduled_verification(create_request())
        .await
        .unwrap();

    let key = crate::scheduler::verification_key(&task.id);
    fx.trigger.fire(&key, Utc::now(), None).await;

    assert_eq!(fx.store.list_history(&task.id).await.unwrap().len(), 1);
}
