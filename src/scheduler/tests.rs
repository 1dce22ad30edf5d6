use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct RecordingJob {
    fires: AtomicUsize,
    fired_ids: Mutex<Vec<String>>,
}

#[async_trait]
impl TriggerJob for RecordingJob {
    async fn fire(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) {
        assert!(next_fire_at.map(|n| n > fired_at).unwrap_or(true));
        self.fires.fetch_add(1, Ordering::SeqCst);
        self.fired_ids.lock().unwrap().push(task_id.to_string());
    }
}

fn registry() -> SchedulerRegistry {
    SchedulerRegistry::new(CancellationToken::new())
}

#[tokio::test]
async fn register_is_idempotent() {
    let registry = registry();
    let job = Arc::new(RecordingJob::default());

    registry.register("sync:a", "*/5 * * * *", job.clone()).await.unwrap();
    registry.register("sync:a", "*/5 * * * *", job.clone()).await.unwrap();
    registry.register("sync:a", "0 * * * *", job.clone()).await.unwrap();

    assert_eq!(registry.count().await, 1);
    assert!(registry.is_registered("sync:a").await);
    assert_eq!(
        registry.expression_of("sync:a").await.as_deref(),
        Some("0 * * * *")
    );

    registry.shutdown().await;
}

#[tokio::test]
async fn malformed_expression_is_reported_and_not_scheduled() {
    let registry = registry();
    let job = Arc::new(RecordingJob::default());

    let err = registry
        .register("sync:bad", "61 * * * *", job.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Registration(_)));
    assert!(!registry.is_registered("sync:bad").await);

    // A bad replacement leaves the working trigger in place.
    registry.register("sync:ok", "@hourly", job.clone()).await.unwrap();
    assert!(registry
        .register("sync:ok", "not a cron", job.clone())
        .await
        .is_err());
    assert_eq!(
        registry.expression_of("sync:ok").await.as_deref(),
        Some("@hourly")
    );

    registry.register("sync:b", "*/10 * * * *", job).await.unwrap();
    assert_eq!(registry.registered_ids().await, vec!["sync:b", "sync:ok"]);

    registry.shutdown().await;
}

#[tokio::test]
async fn unregister_removes_only_the_named_task() {
    let registry = registry();
    let job = Arc::new(RecordingJob::default());
    registry.register("verify:1", "@daily", job.clone()).await.unwrap();
    registry.register("verify:2", "@daily", job).await.unwrap();

    assert!(registry.unregister("verify:1").await);
    assert!(!registry.unregister("verify:1").await);
    assert!(!registry.is_registered("verify:1").await);
    assert!(registry.is_registered("verify:2").await);
    assert_eq!(registry.count().await, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn trigger_fires_until_unregistered() {
    let registry = registry();
    let job = Arc::new(RecordingJob::default());

    registry
        .register("sync:fast", "* * * * * *", job.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2300)).await;

    let fired = job.fires.load(Ordering::SeqCst);
    assert!(fired >= 1, "expected at least one firing, got {fired}");
    assert!(job
        .fired_ids
        .lock()
        .unwrap()
        .iter()
        .all(|id| id == "sync:fast"));

    registry.unregister("sync:fast").await;
    // Let any firing spawned right before removal land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_removal = job.fires.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(job.fires.load(Ordering::SeqCst), after_removal);

    registry.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_triggers_and_refuses_new_ones() {
    let registry = registry();
    let job = Arc::new(RecordingJob::default());
    registry
        .register("sync:a", "* * * * * *", job.clone())
        .await
        .unwrap();

    registry.shutdown().await;
    assert_eq!(registry.count().await, 0);

    let err = registry.register("sync:b", "@hourly", job).await.unwrap_err();
    assert!(matches!(err, EngineError::Registration(_)));
}

#[test]
fn keys_are_namespaced_by_kind() {
    assert_eq!(sync_key("42"), "sync:42");
    assert_eq!(verification_key("42"), "verify:42");
    assert_eq!(task_id_of("sync:42"), "42");
    assert_eq!(task_id_of("verify:abc"), "abc");
    assert_eq!(task_id_of("plain"), "plain");
}

/// Job that takes a while and records when it finished.
#[derive(Default)]
struct SlowJob {
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl TriggerJob for SlowJob {
    async fn fire(
        &self,
        _task_id: &str,
        _fired_at: DateTime<Utc>,
        _next_fire_at: Option<DateTime<Utc>>,
    ) {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(800)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn shutdown_waits_for_firings_in_progress() {
    let registry = registry();
    let job = Arc::new(SlowJob::default());
    registry
        .register("sync:slow", "* * * * * *", job.clone())
        .await
        .unwrap();

    for _ in 0..300 {
        if job.started.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(job.started.load(Ordering::SeqCst) > 0, "trigger never fired");

    registry.shutdown().await;

    let started = job.started.load(Ordering::SeqCst);
    assert_eq!(job.finished.load(Ordering::SeqCst), started);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(job.started.load(Ordering::SeqCst), started);
}
