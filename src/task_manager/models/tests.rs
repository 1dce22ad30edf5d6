use super::*;

#[test]
fn aggregate_status_follows_counts() {
    for success in 0..4u32 {
        for failed in 0..4u32 {
            for not_in_source in 0..4u32 {
                if success + failed + not_in_source == 0 {
                    continue;
                }
                let status = SyncRunStatus::from_counts(success, failed, not_in_source);
                let expected = if success == 0 {
                    SyncRunStatus::Failed
                } else if failed + not_in_source == 0 {
                    SyncRunStatus::Success
                } else {
                    SyncRunStatus::Partial
                };
                assert_eq!(status, expected, "s={success} f={failed} n={not_in_source}");
            }
        }
    }
}

#[test]
fn not_in_source_alone_is_not_success() {
    assert_eq!(SyncRunStatus::from_counts(3, 0, 1), SyncRunStatus::Partial);
    assert_eq!(SyncRunStatus::from_counts(0, 0, 2), SyncRunStatus::Failed);
}

#[test]
fn status_strings_round_trip_through_storage_form() {
    for status in [
        SyncRunStatus::Running,
        SyncRunStatus::Success,
        SyncRunStatus::Partial,
        SyncRunStatus::Failed,
    ] {
        assert_eq!(SyncRunStatus::from_db(status.as_str()).unwrap(), status);
    }
    assert!(DetailStatus::from_db("skipped").is_err());
    assert_eq!(
        DetailStatus::from_db("not_in_source").unwrap(),
        DetailStatus::NotInSource
    );
}

#[test]
fn query_window_parsing() {
    assert_eq!(parse_query_window("30s").unwrap(), 30);
    assert_eq!(parse_query_window("15m").unwrap(), 900);
    assert_eq!(parse_query_window(" 2h ").unwrap(), 7200);
    assert_eq!(parse_query_window("7d").unwrap(), 604_800);
    assert!(parse_query_window("").is_err());
    assert!(parse_query_window("0m").is_err());
    assert!(parse_query_window("15").is_err());
    assert!(parse_query_window("m").is_err());
    assert!(parse_query_window("1w").is_err());
}

fn execution(ip: &str, status: ExecutionStatus) -> VerificationExecution {
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

#[test]
fn batch_summary_waits_for_every_host() {
    assert!(BatchSummary::from_executions(&[]).is_none());
    assert!(BatchSummary::from_executions(&[
        execution("10.0.0.1", ExecutionStatus::Completed),
        execution("10.0.0.2", ExecutionStatus::Running),
    ])
    .is_none());
}

#[test]
fn batch_summary_classifies_terminal_batches() {
    let all_done = BatchSummary::from_executions(&[
        execution("10.0.0.1", ExecutionStatus::Completed),
        execution("10.0.0.2", ExecutionStatus::Completed),
    ])
    .unwrap();
    assert_eq!(all_done.status, HistoryStatus::Success);
    assert_eq!(all_done.completed_hosts, 2);

    let mixed = BatchSummary::from_executions(&[
        execution("10.0.0.1", ExecutionStatus::Completed),
        execution("10.0.0.2", ExecutionStatus::Failed),
    ])
    .unwrap();
    assert_eq!(mixed.status, HistoryStatus::Partial);
    assert_eq!(mixed.failed_hosts, 1);

    let none_done =
        BatchSummary::from_executions(&[execution("10.0.0.1", ExecutionStatus::Failed)]).unwrap();
    assert_eq!(none_done.status, HistoryStatus::Failed);
}

#[test]
fn verification_request_validation() {
    let mut request = VerificationRequest {
        host_ips: vec!["10.0.0.1".to_string()],
        resource_type: ResourceType::Cpu,
        target_percent: 80,
        duration_secs: 600,
        force: false,
    };
    assert!(request.validate().is_ok());

    request.target_percent = 0;
    assert!(request.validate().is_err());
    request.target_percent = 101;
    assert!(request.validate().is_err());

    request.target_percent = 50;
    request.host_ips = vec![" ".to_string()];
    assert!(request.validate().is_err());
}

#[test]
fn create_sync_task_rejects_bad_trigger() {
    let request = CreateSyncTaskRequest {
        name: "cpu sync".to_string(),
        cron_expression: "every five minutes".to_string(),
        data_source: DataSourceKind::Snapshot,
        enabled: true,
        query_window: String::new(),
        endpoint_override: None,
        index_override: None,
    };
    assert!(matches!(
        request.validate(),
        Err(EngineError::Registration(_))
    ));
}

#[test]
fn normalize_host_ips_drops_blanks_and_duplicates() {
    let input = vec![
        " 10.0.0.1 ".to_string(),
        "10.0.0.1".to_string(),
        "".to_string(),
        "10.0.0.2".to_string(),
    ];
    assert_eq!(normalize_host_ips(&input), vec!["10.0.0.1", "10.0.0.2"]);
}
