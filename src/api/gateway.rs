//! Transparent proxy and dispatcher handlers
//!
//! The admission flow shared by both: a ready service is proxied
//! immediately; otherwise the request parks in the service's queue, startup
//! is triggered if the service is cold, and the parked task waits for the
//! readiness edge or a terminal signal under its own deadline.

use super::types::{ApiError, DispatchRequest};
use super::AppState;
use crate::metrics;
use crate::persistence::{self, ActivityRow};
use crate::proxy::{self, ProxyBody, TrackedStream, MAX_BUFFERED_BODY};
use crate::queue::{QueueError, QueueSignal};
use crate::registry::ServiceEntry;
use crate::strategy::RequestContext;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `ANY /services/{id}` — proxy to the service root.
pub async fn transparent_root(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    req: Request,
) -> Response {
    handle_transparent(state, service_id, String::new(), req).await
}

/// `ANY /services/{id}/{*rest}` — transparent proxy; the rest of the path
/// and the query string pass through verbatim.
pub async fn transparent(
    State(state): State<Arc<AppState>>,
    Path((service_id, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    handle_transparent(state, service_id, rest, req).await
}

async fn handle_transparent(
    state: Arc<AppState>,
    service_id: String,
    rest: String,
    req: Request,
) -> Response {
    let entry = match state.registry.resolve(&service_id) {
        Ok(entry) => entry,
        Err(_) => return ApiError::service_not_found(&service_id).into_response(),
    };

    let (parts, body) = req.into_parts();
    let path = format!("/{rest}");
    let query = parts.uri.query().map(str::to_string);

    let body = match read_body(&parts.method, &parts.headers, body).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    let peek = peek_json(&parts.headers, &body);

    let ctx = RequestContext::new(parts.method, path, parts.headers)
        .with_query(query)
        .with_body_peek(peek);

    proxy_flow(state, entry, ctx, body).await
}

/// `POST /v1/requests` — generic dispatcher. Runs the same admission and
/// forwarding path as the transparent proxy, with the target described in
/// the JSON body instead of the URL.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Response {
    let entry = match state.registry.resolve(&request.service_id) {
        Ok(entry) => entry,
        Err(_) => return ApiError::service_not_found(&request.service_id).into_response(),
    };

    let method = match Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return ApiError::bad_request(&format!("Invalid method '{}'", request.method))
                .into_response()
        }
    };

    let path = if request.path.starts_with('/') {
        request.path.clone()
    } else {
        format!("/{}", request.path)
    };

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers.clone().unwrap_or_default() {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(_) => return ApiError::bad_request(&format!("Invalid header '{name}'")).into_response(),
        };
        let value = match HeaderValue::from_str(&value) {
            Ok(value) => value,
            Err(_) => {
                return ApiError::bad_request(&format!("Invalid value for header '{name}'"))
                    .into_response()
            }
        };
        headers.insert(name, value);
    }

    let (body, peek) = match request.body {
        None => (ProxyBody::Empty, None),
        Some(serde_json::Value::String(text)) => (ProxyBody::Buffered(Bytes::from(text)), None),
        Some(value) => {
            let bytes = match serde_json::to_vec(&value) {
                Ok(bytes) => bytes,
                Err(e) => return ApiError::bad_request(&e.to_string()).into_response(),
            };
            headers
                .entry(header::CONTENT_TYPE)
                .or_insert(HeaderValue::from_static("application/json"));
            (ProxyBody::Buffered(Bytes::from(bytes)), Some(value))
        }
    };

    let ctx = RequestContext::new(method, path, headers).with_body_peek(peek);
    proxy_flow(state, entry, ctx, body).await
}

/// Park-or-proceed admission. On `Ok(())` the request has been admitted and
/// activity was touched.
pub(super) async fn admit(
    state: &Arc<AppState>,
    entry: &Arc<ServiceEntry>,
) -> Result<(), ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::shutting_down());
    }

    // Fast path: a ready service is proxied immediately, unordered relative
    // to already-parked entries
    if entry.update_state(|s| {
        if s.is_ready() {
            s.touch();
            true
        } else {
            false
        }
    }) {
        return Ok(());
    }

    let config = entry.config();
    let service_id = config.service_id.clone();

    let rx = entry.queue.enqueue().map_err(|QueueError::Full { capacity }| {
        tracing::warn!(service_id = %service_id, capacity, "Queue saturated");
        ApiError::queue_full(&service_id, capacity)
    })?;

    state.orchestrator.trigger(&service_id);

    // The service may have gone hot between the check and the enqueue; the
    // parked entry is abandoned and reclaimed lazily
    if entry.update_state(|s| {
        if s.is_ready() {
            s.touch();
            true
        } else {
            false
        }
    }) {
        return Ok(());
    }

    let deadline = Duration::from_secs(config.request_timeout_seconds);
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(QueueSignal::Proceed)) => {
            entry.update_state(|s| s.touch());
            Ok(())
        }
        Ok(Ok(QueueSignal::StartupFailed)) => {
            let reason = entry.update_state(|s| s.startup_error.clone());
            Err(ApiError::startup_failed(&service_id, reason))
        }
        Ok(Ok(QueueSignal::GatewayShutdown)) => Err(ApiError::shutting_down()),
        Ok(Ok(QueueSignal::Rejected)) => Err(ApiError::queue_full(&service_id, config.queue_size)),
        Ok(Err(_)) => Err(ApiError::internal("Queue entry dropped without a signal")),
        Err(_) => {
            tracing::warn!(service_id = %service_id, waited_s = deadline.as_secs(), "Queued request timed out");
            Err(ApiError::queue_timeout(&service_id, deadline))
        }
    }
}

/// Admit, resolve, forward, and stream the upstream response back.
async fn proxy_flow(
    state: Arc<AppState>,
    entry: Arc<ServiceEntry>,
    ctx: RequestContext,
    body: ProxyBody,
) -> Response {
    let config = entry.config();
    let service_id = config.service_id.clone();
    let started = Instant::now();

    if let Err(e) = admit(&state, &entry).await {
        metrics::record_request(&service_id, e.status().as_u16(), started.elapsed().as_secs_f64());
        return e.into_response();
    }

    let effective_base = entry.effective_base_url();
    let timeout = Duration::from_secs(config.request_timeout_seconds);

    let upstream = match state
        .proxy
        .dispatch(&service_id, &config, &effective_base, &ctx, body, timeout)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(service_id = %service_id, error = %e, "Upstream request failed");
            let api_error = ApiError::from_proxy(e);
            metrics::record_request(
                &service_id,
                api_error.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            return api_error.into_response();
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !proxy::is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.clone(), value.clone());
        }
    }

    // Activity and accounting settle when the body finishes streaming
    let method = ctx.method.to_string();
    let path = ctx.path.clone();
    let store = state.store.clone();
    let on_complete = {
        let entry = Arc::clone(&entry);
        let service_id = service_id.clone();
        move || {
            entry.update_state(|s| s.touch());
            metrics::record_request(&service_id, status.as_u16(), started.elapsed().as_secs_f64());
            if let Some(store) = &store {
                persistence::record_activity_async(
                    store,
                    ActivityRow {
                        service_id,
                        method,
                        path,
                        status: status.as_u16(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                );
            }
        }
    };

    // Boxing pins the response stream so the tracker can poll it
    let stream = TrackedStream::new(upstream.bytes_stream().boxed(), on_complete);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| ApiError::internal(&e.to_string()).into_response())
}

/// Decide between buffering and streaming the request body.
///
/// Bodies with a known small length are buffered, enabling the JSON peek and
/// the idempotent retry. Unknown-length bodies stream unless the method
/// conventionally carries none.
async fn read_body(
    method: &Method,
    headers: &HeaderMap,
    body: Body,
) -> Result<ProxyBody, ApiError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    match content_length {
        Some(0) => Ok(ProxyBody::Empty),
        Some(n) if n <= MAX_BUFFERED_BODY => {
            let bytes = axum::body::to_bytes(body, MAX_BUFFERED_BODY)
                .await
                .map_err(|e| ApiError::bad_request(&format!("Failed to read body: {e}")))?;
            Ok(ProxyBody::Buffered(bytes))
        }
        Some(_) => Ok(ProxyBody::Streamed(reqwest::Body::wrap_stream(
            body.into_data_stream(),
        ))),
        None => {
            let bodyless = *method == Method::GET
                || *method == Method::HEAD
                || *method == Method::OPTIONS
                || *method == Method::DELETE;
            if bodyless {
                Ok(ProxyBody::Empty)
            } else {
                Ok(ProxyBody::Streamed(reqwest::Body::wrap_stream(
                    body.into_data_stream(),
                )))
            }
        }
    }
}

/// Shallow parse of a small JSON body for strategies.
fn peek_json(headers: &HeaderMap, body: &ProxyBody) -> Option<serde_json::Value> {
    let ProxyBody::Buffered(bytes) = body else {
        return None;
    };
    if bytes.is_empty() {
        return None;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())?;
    if !content_type.contains("json") {
        return None;
    }
    serde_json::from_slice(bytes).ok()
}
