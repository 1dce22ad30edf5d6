use super::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source_for(server: &MockServer) -> WindowSourceConfig {
    WindowSourceConfig {
        endpoint: server.uri(),
        index: "metrics-system".to_string(),
        username: Some("reader".to_string()),
        password: Some("pw".to_string()),
    }
}

fn search_hit(total: u64) -> Value {
    json!({
        "hits": {
            "total": { "value": total, "relation": "eq" },
            "hits": [{ "_source": { "host": { "name": "web-01" } } }]
        },
        "aggregations": {
            "cpu_max": { "value": 0.8734 },
            "cpu_avg": { "value": 0.4 },
            "cpu_min": { "value": 0.05 },
            "memory_max": { "value": 8_000_000_000.0 },
            "memory_avg": { "value": 6_000_000_000.0 },
            "disk_max": { "value": 120_000_000_000.0 },
            "disk_avg": { "value": null }
        }
    })
}

#[test]
fn search_body_filters_by_ip_and_window() {
    let body = build_search_body("10.0.0.7", Duration::from_secs(900));
    let filters = &body["query"]["bool"]["filter"];
    assert_eq!(filters[0]["term"]["host.ip"], "10.0.0.7");
    assert_eq!(filters[1]["range"]["@timestamp"]["gte"], "now-900s");
    assert_eq!(body["aggs"]["cpu_avg"]["avg"]["field"], CPU_FIELD);
}

#[test]
fn zero_hits_is_no_data() {
    let body = json!({ "hits": { "total": { "value": 0 }, "hits": [] } });
    assert_eq!(parse_search_response(&body).unwrap(), QueryOutcome::NoData);

    let legacy = json!({ "hits": { "total": 0, "hits": [] } });
    assert_eq!(parse_search_response(&legacy).unwrap(), QueryOutcome::NoData);
}

#[test]
fn aggregates_become_percent_and_bytes() {
    let outcome = parse_search_response(&search_hit(42)).unwrap();
    let QueryOutcome::Found(HostMetrics::WindowAggregate(metrics)) = outcome else {
        panic!("expected window metrics, got {:?}", outcome);
    };
    assert_eq!(metrics.host_name.as_deref(), Some("web-01"));
    assert_eq!(metrics.cpu_max_percent, Some(87.34));
    assert_eq!(metrics.cpu_avg_percent, Some(40.0));
    assert_eq!(metrics.memory_used_max_bytes, Some(8.0e9));
    assert_eq!(metrics.disk_used_avg_bytes, None);
    assert_eq!(metrics.data_points, 42);
}

#[test]
fn missing_hits_is_an_adapter_error() {
    let err = parse_search_response(&json!({ "error": "boom" })).unwrap_err();
    assert!(matches!(err, EngineError::AdapterTransient(_)));
}

#[tokio::test]
async fn queries_the_index_search_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/metrics-system/_search"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({ "size": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_hit(3)))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = WindowAggregateAdapter::new(reqwest::Client::new(), source_for(&server));
    let outcome = adapter
        .query_host_metrics("10.0.0.7", Duration::from_secs(600))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        QueryOutcome::Found(HostMetrics::WindowAggregate(_))
    ));
}

#[tokio::test]
async fn auth_failure_is_distinct_from_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/metrics-system/_search"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let adapter = WindowAggregateAdapter::new(reqwest::Client::new(), source_for(&server));
    let err = adapter
        .query_host_metrics("10.0.0.7", Duration::from_secs(600))
        .await
        .unwrap_err();

    match err {
        EngineError::AdapterTransient(message) => assert!(message.contains("401"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
}
