//! End-to-end routing through a gateway wired from configuration
//!
//! Backends are wiremock servers; the gateway runs with the system clock.

use gatewarden_core::clock::system_clock;
use gatewarden_observability::Metrics;
use gatewarden_routing::{CircuitState, GatewayConfig, RequestContext, RoutingOrchestrator};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn config_for(backends: &[&MockServer]) -> GatewayConfig {
    let instances: Vec<String> = backends
        .iter()
        .enumerate()
        .map(|(i, server)| format!("      - id: i{}\n        url: {}\n", i + 1, server.uri()))
        .collect();

    let yaml = format!(
        r#"
circuit_breaker:
  volume_threshold: 3
load_balancer:
  health_check:
    enabled: false
routes:
  - path: /api/users
    service: users
    methods: [GET, POST]
  - path: /api/admin
    service: users
    auth_required: true
    rate_limit:
      per_minute: 2
services:
  - name: users
    instances:
{}
api_keys:
  - key: secret
    key_id: ops
    permissions: [admin]
"#,
        instances.concat()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

async fn backend(body: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_round_robin_across_configured_instances() {
    let first = backend(json!({"from": "i1"})).await;
    let second = backend(json!({"from": "i2"})).await;

    let config = config_for(&[&first, &second]);
    config.validate().unwrap();
    let gateway = RoutingOrchestrator::from_config(&config, system_clock(), None).unwrap();

    let request = RequestContext::new("GET", "/api/v1/users");
    let mut seen = Vec::new();
    for _ in 0..4 {
        let outcome = gateway.route_request(&request).await;
        assert!(outcome.success, "unexpected outcome: {:?}", outcome);
        assert_eq!(outcome.api_version, 1);
        seen.push(outcome.data.unwrap()["from"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["i1", "i2", "i1", "i2"]);

    // Both backends saw the canonical path
    let received = first.received_requests().await.unwrap();
    assert_eq!(received[0].url.path(), "/api/users");

    gateway.shutdown();
}

#[tokio::test]
async fn test_static_keys_and_route_quota() {
    let server = backend(json!("ok")).await;
    let config = config_for(&[&server]);
    let gateway = RoutingOrchestrator::from_config(&config, system_clock(), None).unwrap();

    let anonymous = gateway
        .route_request(&RequestContext::new("GET", "/api/admin"))
        .await;
    assert_eq!(anonymous.status, 401);

    let request = RequestContext::new("GET", "/api/admin")
        .with_header("Authorization", "Bearer secret")
        .with_header("X-Forwarded-For", "192.0.2.10");
    assert_eq!(gateway.route_request(&request).await.status, 200);
    assert_eq!(gateway.route_request(&request).await.status, 200);

    let blocked = gateway.route_request(&request).await;
    assert_eq!(blocked.status, 429);
    assert_eq!(blocked.remaining, Some(0));
}

#[tokio::test]
async fn test_failing_backend_opens_circuit() {
    let server = MockServer::start().await;
    Mock::given(path("/api/users"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let config = config_for(&[&server]);
    let metrics = Arc::new(Metrics::new().unwrap());
    let gateway =
        RoutingOrchestrator::from_config(&config, system_clock(), Some(metrics.clone())).unwrap();

    let request = RequestContext::new("GET", "/api/users");
    for _ in 0..3 {
        let outcome = gateway.route_request(&request).await;
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.error.as_deref(), Some("Internal server error"));
    }

    // Open: the backend is not called a fourth time
    let outcome = gateway.route_request(&request).await;
    assert_eq!(outcome.circuit_state, Some(CircuitState::Open));

    let report = gateway.health_report();
    assert_eq!(report.status, "degraded");
    assert_eq!(report.registry.total, 1);

    let rendered = metrics.render().unwrap();
    assert!(rendered.contains("gatewarden_requests_total"));
    assert!(rendered.contains("gatewarden_circuit_breaker_transitions_total"));
}

#[tokio::test]
async fn test_deregistered_service_yields_internal_error() {
    let server = backend(json!("ok")).await;
    let config = config_for(&[&server]);
    let gateway = RoutingOrchestrator::from_config(&config, system_clock(), None).unwrap();

    gateway.registry().deregister_service("users-i1");
    let outcome = gateway
        .route_request(&RequestContext::new("GET", "/api/users"))
        .await;
    assert_eq!(outcome.status, 500);

    let stats = gateway.circuit_breakers().get_stats("users").unwrap();
    assert_eq!(stats.failure_count, 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}
