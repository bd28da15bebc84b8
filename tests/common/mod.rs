//! Shared test utilities for Hestia integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use hestia::api::{create_router, AppState};
use hestia::config::{HestiaConfig, ServiceConfig};
use hestia::executor::RemoteExecutor;
use hestia::registry::ServiceRegistry;
use http_body_util::BodyExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

/// Service config pointed at a test upstream, tuned for fast tests.
pub fn make_service(id: &str, base_url: &str) -> ServiceConfig {
    ServiceConfig {
        service_id: id.to_string(),
        base_url: base_url.to_string(),
        warmup_ms: 0,
        retry_count: 1,
        retry_delay_ms: 10,
        queue_size: 10,
        request_timeout_seconds: 5,
        ..ServiceConfig::default()
    }
}

/// Gateway config with fast probe/sweep cadences.
pub fn make_config(services: Vec<ServiceConfig>) -> HestiaConfig {
    let mut map = BTreeMap::new();
    for service in services {
        map.insert(service.service_id.clone(), service);
    }
    let mut config = HestiaConfig {
        services: map,
        ..HestiaConfig::default()
    };
    config.server.probe_interval_ms = 20;
    config.server.idle_sweep_interval_ms = 20;
    config.server.database_path = None;
    config
}

pub struct TestGateway {
    pub app: Router,
    pub state: Arc<AppState>,
    pub registry: Arc<ServiceRegistry>,
    pub cancel: CancellationToken,
}

/// Build a gateway (no background tasks running) from a config.
pub fn build_gateway(config: HestiaConfig) -> TestGateway {
    build_gateway_with_executor(config, None)
}

pub fn build_gateway_with_executor(
    config: HestiaConfig,
    executor: Option<Arc<dyn RemoteExecutor>>,
) -> TestGateway {
    let registry = Arc::new(ServiceRegistry::from_config(&config));
    let cancel = CancellationToken::new();
    let state = Arc::new(AppState::new(
        Arc::new(config),
        Arc::clone(&registry),
        executor,
        None,
        cancel.clone(),
    ));
    let app = create_router(Arc::clone(&state));
    TestGateway {
        app,
        state,
        registry,
        cancel,
    }
}

/// Drive one request through the router and collect the response.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    let bytes = serde_json::to_vec(&body).unwrap();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("content-length", bytes.len())
        .body(Body::from(bytes))
        .unwrap()
}

/// Force a service Hot/Ready, as if a startup just completed.
pub fn make_hot(registry: &ServiceRegistry, service_id: &str) {
    registry
        .update_state(service_id, |s| {
            s.lifecycle = hestia::registry::Lifecycle::Hot;
            s.readiness = hestia::registry::Readiness::Ready;
            s.touch();
        })
        .expect("service must exist");
}
