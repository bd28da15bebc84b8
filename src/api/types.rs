//! Request and response types for the gateway API

use crate::proxy::ProxyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Body of the generic dispatcher endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub service_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Strategy listing for `/v1/strategies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<String>,
    pub services: std::collections::BTreeMap<String, ServiceStrategyInfo>,
}

/// Per-service strategy configuration as exposed by `/v1/strategies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStrategyInfo {
    pub strategy: Option<String>,
    pub instances: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub by_model: HashMap<String, String>,
}

/// JSON error envelope returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorBody,
    #[serde(skip)]
    status: u16,
    #[serde(skip)]
    retry_after: Option<u64>,
}

/// Error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, r#type: &str, message: String) -> Self {
        Self {
            error: ApiErrorBody {
                message,
                r#type: r#type.to_string(),
                code: Some(r#type.to_string()),
            },
            status: status.as_u16(),
            retry_after: None,
        }
    }

    /// 404: unknown service id with no default configured.
    pub fn service_not_found(service_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "service_not_found",
            format!("Service '{service_id}' is not configured"),
        )
    }

    /// 503: the service's queue is saturated.
    pub fn queue_full(service_id: &str, capacity: usize) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_full",
            format!("Queue for service '{service_id}' is full ({capacity} requests)"),
        )
    }

    /// 504: the entry's deadline passed while waiting for readiness.
    pub fn queue_timeout(service_id: &str, waited: Duration) -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "queue_timeout",
            format!(
                "Request for service '{service_id}' timed out after {}s waiting for readiness",
                waited.as_secs()
            ),
        )
    }

    /// 502: startup exhausted all attempts; carries the last startup error.
    pub fn startup_failed(service_id: &str, reason: Option<String>) -> Self {
        let reason = reason.unwrap_or_else(|| "startup failed".to_string());
        Self::new(
            StatusCode::BAD_GATEWAY,
            "startup_failed",
            format!("Service '{service_id}' failed to start: {reason}"),
        )
    }

    /// 503 with Retry-After: the gateway is stopping.
    pub fn shutting_down() -> Self {
        let mut err = Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "Gateway is shutting down".to_string(),
        );
        err.retry_after = Some(5);
        err
    }

    /// 400: malformed request.
    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message.to_string())
    }

    /// 401: missing or unknown API key.
    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid API key".to_string(),
        )
    }

    /// 500: unexpected internal condition.
    pub fn internal(message: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message.to_string(),
        )
    }

    /// Map a proxy failure: transport errors are 502, upstream timeouts 504.
    pub fn from_proxy(error: ProxyError) -> Self {
        match error {
            ProxyError::Timeout(ms) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                format!("Upstream did not respond within {ms}ms"),
            ),
            other => Self::new(StatusCode::BAD_GATEWAY, "upstream_error", other.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert_eq!(ApiError::service_not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::queue_full("x", 10).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::queue_timeout("x", Duration::from_secs(60)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::startup_failed("x", None).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::unauthorized().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_startup_failed_carries_reason() {
        let err = ApiError::startup_failed("svc-a", Some("probe refused".to_string()));
        assert!(err.error.message.contains("probe refused"));
        assert_eq!(err.error.r#type, "startup_failed");
    }

    #[test]
    fn test_shutting_down_has_retry_after() {
        let response = ApiError::shutting_down().into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get(axum::http::header::RETRY_AFTER)
                .unwrap(),
            "5"
        );
    }

    #[test]
    fn test_proxy_error_mapping() {
        assert_eq!(
            ApiError::from_proxy(ProxyError::Timeout(5000)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from_proxy(ProxyError::Connect(
                "http://u".to_string(),
                "refused".to_string()
            ))
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_dispatch_request_parses_camel_case() {
        let request: DispatchRequest = serde_json::from_value(serde_json::json!({
            "serviceId": "svc-a",
            "method": "POST",
            "path": "/generate",
            "body": {"model": "m1"}
        }))
        .unwrap();
        assert_eq!(request.service_id, "svc-a");
        assert_eq!(request.method, "POST");
        assert!(request.headers.is_none());
    }

    #[test]
    fn test_error_envelope_shape() {
        let json = serde_json::to_value(ApiError::queue_full("svc", 1)).unwrap();
        assert!(json["error"]["message"].is_string());
        assert_eq!(json["error"]["type"], "queue_full");
    }
}
