use super::*;
use crate::task_manager::models::{ExecutionStatus, ResourceType};
use crate::task_manager::EngineStore;
use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Service that answers each poll with the next scripted status list and
/// repeats the last one forever.
struct ScriptedService {
    receipt: Result<SubmissionReceipt>,
    polls: Mutex<Vec<Result<Vec<VerificationExecution>>>>,
    poll_count: AtomicUsize,
}

impl ScriptedService {
    fn new(polls: Vec<Result<Vec<VerificationExecution>>>) -> Self {
        Self {
            receipt: Ok(SubmissionReceipt {
                execution_task_id: "exec-1".to_string(),
                accepted_hosts: 2,
                rejected_hosts: 0,
                message: None,
            }),
            polls: Mutex::new(polls),
            poll_count: AtomicUsize::new(0),
        }
    }

    fn rejecting(message: &str) -> Self {
        let mut service = Self::new(Vec::new());
        service.receipt = Err(EngineError::SubmissionRejected(message.to_string()));
        service
    }
}

#[async_trait]
impl VerificationService for ScriptedService {
    async fn submit(&self, _request: &VerificationRequest) -> Result<SubmissionReceipt> {
        match &self.receipt {
            Ok(receipt) => Ok(receipt.clone()),
            Err(e) => Err(EngineError::SubmissionRejected(e.to_string())),
        }
    }

    async fn query_status(&self, _execution_task_id: &str) -> Result<Vec<VerificationExecution>> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let mut polls = self.polls.lock().unwrap();
        if polls.len() > 1 {
            return polls.remove(0);
        }
        match polls.first() {
            Some(Ok(executions)) => Ok(executions.clone()),
            Some(Err(e)) => Err(EngineError::AdapterTransient(e.to_string())),
            None => Ok(Vec::new()),
        }
    }
}

fn exec(ip: &str, status: ExecutionStatus) -> VerificationExecution {
    VerificationExecution {
        host_ip: ip.to_string(),
        status,
        started_at: None,
        finished_at: None,
        exit_code: None,
        stdout_log: None,
        stderr_log: None,
    }
}

fn request() -> VerificationRequest {
    VerificationRequest {
        host_ips: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        resource_type: ResourceType::Memory,
        target_percent: 75,
        duration_secs: 300,
        force: false,
    }
}

fn fast_settings() -> PollSettings {
    PollSettings {
        initial_delay: Duration::from_millis(10),
        interval: Duration::from_millis(20),
        ceiling: Duration::from_millis(300),
    }
}

async fn memory_store() -> Arc<EngineStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Arc::new(EngineStore::new(pool).await.unwrap())
}

fn orchestrator(
    service: Arc<ScriptedService>,
    store: Arc<EngineStore>,
    settings: PollSettings,
) -> VerificationOrchestrator {
    VerificationOrchestrator::new(service, store, settings, CancellationToken::new())
}

#[tokio::test]
async fn monitor_finalizes_history_once_all_hosts_are_terminal() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::new(vec![
        Ok(vec![
            exec("10.0.0.1", ExecutionStatus::Running),
            exec("10.0.0.2", ExecutionStatus::Pending),
        ]),
        Ok(vec![
            exec("10.0.0.1", ExecutionStatus::Completed),
            exec("10.0.0.2", ExecutionStatus::Running),
        ]),
        Ok(vec![
            exec("10.0.0.1", ExecutionStatus::Completed),
            exec("10.0.0.2", ExecutionStatus::Completed),
        ]),
    ]));
    let verification = orchestrator(service.clone(), store.clone(), fast_settings());

    let history_id = store.create_history("nightly", Utc::now(), 2).await.unwrap();
    let outcome = verification
        .submit_for_history(&request(), history_id)
        .await
        .unwrap();
    assert!(outcome.accepted());
    assert_eq!(outcome.execution_task_id, "exec-1");

    let polled = outcome.monitor.await.unwrap();
    let PollOutcome::Completed(summary) = polled else {
        panic!("expected completion, got {:?}", polled);
    };
    assert_eq!(summary.status, HistoryStatus::Success);
    assert_eq!(summary.completed_hosts, 2);
    assert_eq!(service.poll_count.load(Ordering::SeqCst), 3);

    let row = store.get_history(history_id).await.unwrap().unwrap();
    assert_eq!(row.execution_task_id.as_deref(), Some("exec-1"));
    assert_eq!(row.status, HistoryStatus::Success);
    assert!(row.finished_at.is_some());

    let hosts = store.list_host_executions("exec-1").await.unwrap();
    assert!(hosts.iter().all(|h| h.status == ExecutionStatus::Completed));
}

#[tokio::test]
async fn mixed_and_all_failed_batches() {
    for (statuses, expected) in [
        (
            [ExecutionStatus::Completed, ExecutionStatus::Failed],
            HistoryStatus::Partial,
        ),
        (
            [ExecutionStatus::Failed, ExecutionStatus::Failed],
            HistoryStatus::Failed,
        ),
    ] {
        let store = memory_store().await;
        let service = Arc::new(ScriptedService::new(vec![Ok(vec![
            exec("10.0.0.1", statuses[0]),
            exec("10.0.0.2", statuses[1]),
        ])]));
        let verification = orchestrator(service, store.clone(), fast_settings());
        let history_id = store.create_history("t", Utc::now(), 2).await.unwrap();

        let outcome = verification
            .submit_for_history(&request(), history_id)
            .await
            .unwrap();
        let polled = outcome.monitor.await.unwrap();
        assert!(matches!(polled, PollOutcome::Completed(s) if s.status == expected));

        let row = store.get_history(history_id).await.unwrap().unwrap();
        assert_eq!(row.status, expected);
    }
}

#[tokio::test]
async fn monitor_gives_up_at_the_ceiling() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::new(vec![Ok(vec![
        exec("10.0.0.1", ExecutionStatus::Completed),
        exec("10.0.0.2", ExecutionStatus::Running),
    ])]));
    let verification = orchestrator(service.clone(), store.clone(), fast_settings());
    let history_id = store.create_history("t", Utc::now(), 2).await.unwrap();

    let started = Instant::now();
    let outcome = verification
        .submit_for_history(&request(), history_id)
        .await
        .unwrap();
    assert_eq!(outcome.monitor.await.unwrap(), PollOutcome::TimedOut);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert!(service.poll_count.load(Ordering::SeqCst) >= 2);

    // Abandoned batches keep their submission status and stay unfinished.
    let row = store.get_history(history_id).await.unwrap().unwrap();
    assert_eq!(row.status, HistoryStatus::Success);
    assert!(row.finished_at.is_none());
}

#[tokio::test]
async fn empty_status_is_not_terminal_and_poll_errors_are_retried() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::new(vec![
        Ok(Vec::new()),
        Err(EngineError::AdapterTransient("502 bad gateway".to_string())),
        Ok(vec![
            exec("10.0.0.1", ExecutionStatus::Completed),
            exec("10.0.0.2", ExecutionStatus::Completed),
        ]),
    ]));
    let verification = orchestrator(service.clone(), store, fast_settings());

    let outcome = verification.submit(&request()).await.unwrap();
    assert!(matches!(
        outcome.monitor.await.unwrap(),
        PollOutcome::Completed(_)
    ));
    assert_eq!(service.poll_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_submission_starts_no_monitor() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::rejecting("quota exceeded"));
    let verification = orchestrator(service.clone(), store, fast_settings());

    let err = verification.submit(&request()).await.unwrap_err();
    assert!(matches!(err, EngineError::SubmissionRejected(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.poll_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_request_is_refused_before_submission() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::new(Vec::new()));
    let verification = orchestrator(service, store, fast_settings());

    let mut bad = request();
    bad.target_percent = 0;
    assert!(matches!(
        verification.submit(&bad).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn shutdown_cancels_monitors() {
    let store = memory_store().await;
    let service = Arc::new(ScriptedService::new(vec![Ok(vec![exec(
        "10.0.0.1",
        ExecutionStatus::Running,
    )])]));
    let shutdown = CancellationToken::new();
    let verification = VerificationOrchestrator::new(
        service,
        store,
        PollSettings {
            ceiling: Duration::from_secs(60),
            ..fast_settings()
        },
        shutdown.clone(),
    );

    let outcome = verification.submit(&request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let polled = tokio::time::timeout(Duration::from_secs(1), outcome.monitor)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(polled, PollOutcome::Cancelled);
}

#[test]
fn poll_settings_follow_config() {
    let settings = PollSettings::from(&VerificationConfig::default());
    assert_eq!(settings.initial_delay, Duration::from_secs(30));
    assert_eq!(settings.interval, Duration::from_secs(30));
    assert_eq!(settings.ceiling, Duration::from_secs(7200));
}

fn http_service(server: &MockServer) -> HttpVerificationService {
    HttpVerificationService::new(&VerificationConfig {
        endpoint: server.uri(),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn http_service_submits_and_reads_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .and(body_partial_json(json!({
            "hostIps": ["10.0.0.1", "10.0.0.2"],
            "resourceType": "memory",
            "targetPercent": 75
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "executionTaskId": "exec-77",
            "acceptedHosts": 2,
            "rejectedHosts": 0
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/exec-77", SUBMIT_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "executions": [
                {
                    "hostIp": "10.0.0.1",
                    "status": "completed",
                    "startedAt": "2026-03-04T10:00:00Z",
                    "finishedAt": "2026-03-04T10:05:00Z",
                    "exitCode": 0,
                    "stdoutLog": "ok",
                    "stderrLog": null
                },
                { "hostIp": "10.0.0.2", "status": "running" }
            ]
        })))
        .mount(&server)
        .await;

    let service = http_service(&server);
    let receipt = service.submit(&request()).await.unwrap();
    assert_eq!(receipt.execution_task_id, "exec-77");
    assert_eq!(receipt.accepted_hosts, 2);

    let executions = service.query_status("exec-77").await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].exit_code, Some(0));
    assert_eq!(executions[1].status, ExecutionStatus::Running);
    assert!(executions[1].finished_at.is_none());
}

#[tokio::test]
async fn http_service_maps_refusal_to_submission_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_string("hosts busy"))
        .mount(&server)
        .await;

    let err = http_service(&server).submit(&request()).await.unwrap_err();
    match err {
        EngineError::SubmissionRejected(message) => {
            assert!(message.contains("409"), "{message}");
            assert!(message.contains("hosts busy"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
