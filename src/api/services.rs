//! Service management handlers: status, start, stop, strategies, metrics

use super::types::{ApiError, ServiceStrategyInfo, StrategiesResponse};
use super::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `GET /v1/services/{id}/status`
///
/// Reports lifecycle, readiness, and queue depth. When the service looks
/// Cold but has a health endpoint, one opportunistic probe reconciles the
/// in-memory state with observed upstream liveness: a live upstream flips
/// the service to Hot/Ready without a proxied request.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> Response {
    let Some(entry) = state.registry.get(&service_id) else {
        return ApiError::service_not_found(&service_id).into_response();
    };

    let config = entry.config();
    let is_cold = entry.update_state(|s| s.lifecycle == crate::registry::Lifecycle::Cold);
    if is_cold {
        if let Some(health_url) = &config.health_url {
            if state.prober.probe_once(health_url).await {
                let flipped = entry.update_state(|s| {
                    if s.lifecycle == crate::registry::Lifecycle::Cold {
                        s.lifecycle = crate::registry::Lifecycle::Hot;
                        s.readiness = crate::registry::Readiness::Ready;
                        s.touch();
                        true
                    } else {
                        false
                    }
                });
                if flipped {
                    tracing::info!(service_id = %service_id, "Opportunistic probe found service live");
                }
            }
        }
    }

    Json(entry.view()).into_response()
}

/// `POST /v1/services/{id}/start` — proactive warmup. Triggers a startup if
/// the service is Cold and returns the current state either way.
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> Response {
    let Some(entry) = state.registry.get(&service_id) else {
        return ApiError::service_not_found(&service_id).into_response();
    };

    let triggered = state.orchestrator.trigger(&service_id);
    let status = if triggered {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(entry.view())).into_response()
}

/// `POST /v1/services/{id}/stop` — request the idle-shutdown path.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> Response {
    let Some(entry) = state.registry.get(&service_id) else {
        return ApiError::service_not_found(&service_id).into_response();
    };

    let demoted = entry.update_state(|s| {
        if s.lifecycle == crate::registry::Lifecycle::Hot {
            s.begin_stopping();
            true
        } else {
            false
        }
    });

    if demoted {
        state.idle.stop_service(&service_id, &entry).await;
    }

    Json(entry.view()).into_response()
}

/// `GET /v1/strategies` — loaded strategies and per-service strategy config.
pub async fn strategies(State(state): State<Arc<AppState>>) -> Json<StrategiesResponse> {
    let mut services = BTreeMap::new();
    for entry in state.registry.list() {
        let config = entry.config();
        services.insert(
            config.service_id.clone(),
            ServiceStrategyInfo {
                strategy: config.strategy_name.clone(),
                instances: config.instances.iter().map(|i| i.url.clone()).collect(),
                by_model: config.routing.by_model.clone().into_iter().collect(),
            },
        );
    }

    Json(StrategiesResponse {
        strategies: state
            .proxy
            .strategies()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        services,
    })
}

/// `GET /v1/metrics` — Prometheus exposition text.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics_collector.update_fleet_gauges();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics_collector.render_metrics(),
    )
}
