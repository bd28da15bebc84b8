//! Reverse proxy
//!
//! Forwards admitted requests to the resolved upstream: method preserved,
//! hop-by-hop headers stripped, Host rewritten to the upstream authority,
//! bodies streamed in both directions. Upstream outcomes feed the strategy
//! health tracker, and idempotent requests get at most one retry against the
//! strategy's next pick.

use crate::config::ServiceConfig;
use crate::strategy::{RequestContext, Resolution, StrategyRegistry};
use axum::http::{header, Method};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;

/// Request bodies up to this size are buffered, which enables the JSON model
/// peek and the single idempotent retry. Larger bodies stream end-to-end and
/// are never retried.
pub const MAX_BUFFERED_BODY: usize = 64 * 1024;

/// Errors from forwarding to an upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Upstream timeout after {0}ms")]
    Timeout(u64),

    #[error("Cannot connect to upstream {0}: {1}")]
    Connect(String, String),

    #[error("Upstream transport error: {0}")]
    Transport(String),
}

/// Request body as seen by the proxy.
pub enum ProxyBody {
    Empty,
    /// Small body, held in memory; replayable for the retry
    Buffered(Bytes),
    /// Large body, streamed through; single attempt only
    Streamed(reqwest::Body),
}

impl ProxyBody {
    pub fn is_replayable(&self) -> bool {
        !matches!(self, ProxyBody::Streamed(_))
    }
}

/// Hop-by-hop headers are connection-scoped and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Methods safe to retry once after a transport error or 5xx.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::PUT
        || *method == Method::DELETE
}

/// Join the upstream base with the request path and query.
fn build_upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
        _ => format!("{base}{path}"),
    }
}

/// Forwarding engine shared by the transparent proxy and the dispatcher.
pub struct ProxyEngine {
    client: reqwest::Client,
    strategies: Arc<StrategyRegistry>,
}

impl ProxyEngine {
    pub fn new(strategies: Arc<StrategyRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .build()
            .unwrap_or_default();
        Self { client, strategies }
    }

    pub fn strategies(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    /// Resolve an upstream and forward the request, applying the retry policy.
    ///
    /// The returned response's body has not been consumed; the caller streams
    /// it to the client.
    pub async fn dispatch(
        &self,
        service_id: &str,
        config: &ServiceConfig,
        effective_base: &str,
        ctx: &RequestContext,
        body: ProxyBody,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let resolution = self
            .strategies
            .resolve(service_id, ctx, config, effective_base);
        tracing::debug!(
            service_id,
            upstream = %resolution.url,
            reason = ?resolution.reason,
            method = %ctx.method,
            path = %ctx.path,
            "Forwarding request"
        );

        let bytes = match body {
            ProxyBody::Streamed(stream) => {
                let result = self.send(&resolution.url, ctx, Some(stream), timeout).await;
                self.observe(&resolution.url, &result);
                return result;
            }
            ProxyBody::Buffered(bytes) => Some(bytes),
            ProxyBody::Empty => None,
        };

        self.send_with_retry(service_id, config, effective_base, ctx, resolution, bytes, timeout)
            .await
    }

    async fn send_with_retry(
        &self,
        service_id: &str,
        config: &ServiceConfig,
        effective_base: &str,
        ctx: &RequestContext,
        resolution: Resolution,
        bytes: Option<Bytes>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let first = self
            .send(
                &resolution.url,
                ctx,
                bytes.clone().map(reqwest::Body::from),
                timeout,
            )
            .await;
        self.observe(&resolution.url, &first);

        let failed = match &first {
            Err(_) => true,
            Ok(resp) => resp.status().is_server_error(),
        };
        if !failed || !is_idempotent(&ctx.method) {
            return first;
        }

        // At most one retry, against whatever the strategy now prefers
        let retry_target = self
            .strategies
            .resolve(service_id, ctx, config, effective_base);
        tracing::info!(
            service_id,
            failed_upstream = %resolution.url,
            retry_upstream = %retry_target.url,
            "Retrying idempotent request"
        );
        metrics::counter!("hestia_proxy_retries_total", "service" => service_id.to_string())
            .increment(1);

        let second = self
            .send(&retry_target.url, ctx, bytes.map(reqwest::Body::from), timeout)
            .await;
        self.observe(&retry_target.url, &second);
        second
    }

    async fn send(
        &self,
        upstream: &str,
        ctx: &RequestContext,
        body: Option<reqwest::Body>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = build_upstream_url(upstream, &ctx.path, ctx.query.as_deref());

        let mut builder = self
            .client
            .request(ctx.method.clone(), &url)
            .timeout(timeout);

        for (name, value) in ctx.headers.iter() {
            // Host is rewritten to the upstream authority by the client
            if name == header::HOST || is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }

        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(timeout.as_millis() as u64)
            } else if e.is_connect() {
                ProxyError::Connect(upstream.to_string(), e.to_string())
            } else {
                ProxyError::Transport(e.to_string())
            }
        })
    }

    /// Feed the strategies' passive health tracker: 2xx/3xx marks healthy,
    /// transport errors and 5xx count as failures, 4xx is neutral.
    fn observe(&self, url: &str, result: &Result<reqwest::Response, ProxyError>) {
        match result {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                self.strategies.report(url, true);
            }
            Ok(resp) if resp.status().is_server_error() => {
                self.strategies.report(url, false);
            }
            Ok(_) => {}
            Err(_) => {
                self.strategies.report(url, false);
            }
        }
    }
}

/// Response body stream that runs a callback once the body has fully
/// streamed to the client. Used to update `last_activity_at` and close out
/// the request's activity record at response completion.
pub struct TrackedStream<S> {
    inner: S,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_complete: Some(Box::new(on_complete)),
        }
    }
}

impl<S, E> Stream for TrackedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                if let Some(callback) = self.on_complete.take() {
                    callback();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(is_hop_by_hop("TE"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Request-Id"));
        assert!(!is_hop_by_hop("Host"));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));

        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn test_build_upstream_url() {
        assert_eq!(
            build_upstream_url("http://svc:8000/", "/v1/x", None),
            "http://svc:8000/v1/x"
        );
        assert_eq!(
            build_upstream_url("http://svc:8000", "/v1/x", Some("a=1&b=2")),
            "http://svc:8000/v1/x?a=1&b=2"
        );
        assert_eq!(
            build_upstream_url("http://svc:8000", "/", Some("")),
            "http://svc:8000/"
        );
    }

    #[test]
    fn test_proxy_body_replayability() {
        assert!(ProxyBody::Empty.is_replayable());
        assert!(ProxyBody::Buffered(Bytes::from("x")).is_replayable());
        assert!(!ProxyBody::Streamed(reqwest::Body::from("x")).is_replayable());
    }

    #[tokio::test]
    async fn tracked_stream_fires_on_completion() {
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = futures_util::stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from("a")),
            Ok(Bytes::from("b")),
        ]);
        let mut stream = TrackedStream::new(inner, move || {
            tx.send(()).unwrap();
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert!(rx.try_recv().is_err(), "must not fire mid-stream");
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("b"));
        assert!(stream.next().await.is_none());
        assert!(rx.try_recv().is_ok(), "fires once the body completes");
    }
}
