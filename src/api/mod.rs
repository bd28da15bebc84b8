//! HTTP surface of the gateway
//!
//! A single axum router serves both faces of the gateway: the transparent
//! proxy under `/services/{id}/...`, and the management surface under `/v1`
//! (dispatcher, status, start/stop, strategies, metrics). Management routes
//! optionally require an API key; transparent proxying is never gated.

mod gateway;
mod services;
pub mod types;

pub use types::*;

use crate::config::HestiaConfig;
use crate::executor::RemoteExecutor;
use crate::idle::IdleMonitor;
use crate::metrics::MetricsCollector;
use crate::persistence::MetadataStore;
use crate::proxy::ProxyEngine;
use crate::readiness::ReadinessProber;
use crate::registry::ServiceRegistry;
use crate::startup::StartupOrchestrator;
use crate::strategy::StrategyRegistry;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;

/// Maximum body size for management requests (the transparent proxy streams
/// bodies of any size).
const MAX_MANAGEMENT_BODY: usize = 10 * 1024 * 1024;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: Arc<HestiaConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub proxy: ProxyEngine,
    pub orchestrator: Arc<StartupOrchestrator>,
    pub idle: Arc<IdleMonitor>,
    pub prober: Arc<ReadinessProber>,
    pub store: Option<Arc<MetadataStore>>,
    pub metrics_collector: Arc<MetricsCollector>,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    /// Wire up the gateway's components from configuration.
    pub fn new(
        config: Arc<HestiaConfig>,
        registry: Arc<ServiceRegistry>,
        executor: Option<Arc<dyn RemoteExecutor>>,
        store: Option<Arc<MetadataStore>>,
        shutdown: CancellationToken,
    ) -> Self {
        let start_time = Instant::now();

        let prober = Arc::new(ReadinessProber::new(Duration::from_millis(
            config.server.probe_interval_ms,
        )));

        let orchestrator = Arc::new(StartupOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&prober),
            executor.clone(),
            store.clone(),
            shutdown.clone(),
        ));

        let idle = Arc::new(IdleMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&orchestrator),
            executor,
            store.clone(),
            Duration::from_millis(config.server.idle_sweep_interval_ms),
        ));

        let strategies = Arc::new(StrategyRegistry::with_defaults());
        let proxy = ProxyEngine::new(strategies);

        // Reuse an existing recorder when one is already installed (tests)
        let prometheus_handle = crate::metrics::setup_metrics().unwrap_or_else(|e| {
            tracing::debug!("Metrics recorder already installed: {e}");
            crate::metrics::PrometheusBuilder::new().build_recorder().handle()
        });
        let metrics_collector = Arc::new(MetricsCollector::new(
            Arc::clone(&registry),
            start_time,
            prometheus_handle,
        ));

        Self {
            config,
            registry,
            proxy,
            orchestrator,
            idle,
            prober,
            store,
            metrics_collector,
            shutdown,
            start_time,
        }
    }
}

/// Create the main router with all endpoints configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    let management = Router::new()
        .route("/v1/requests", post(gateway::dispatch))
        .route("/v1/services/{id}/status", get(services::status))
        .route("/v1/services/{id}/start", post(services::start))
        .route("/v1/services/{id}/stop", post(services::stop))
        .route("/v1/strategies", get(services::strategies))
        .route("/v1/metrics", get(services::metrics))
        .layer(RequestBodyLimitLayer::new(MAX_MANAGEMENT_BODY))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/services/{id}", any(gateway::transparent_root))
        .route("/services/{id}/{*rest}", any(gateway::transparent))
        .merge(management)
        .with_state(state)
}

/// Gate management routes behind `X-Api-Key` when configured and at least
/// one key is registered.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.server.require_api_key {
        return next.run(request).await;
    }
    let Some(store) = state.store.clone() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let allowed = tokio::task::spawn_blocking(move || {
        // No registered keys means the gate is not yet armed
        if !store.has_api_keys().unwrap_or(false) {
            return true;
        }
        presented
            .map(|key| store.verify_api_key(&key).unwrap_or(false))
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);

    if allowed {
        next.run(request).await
    } else {
        types::ApiError::unauthorized().into_response()
    }
}
