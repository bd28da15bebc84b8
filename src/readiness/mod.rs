//! Readiness probing for starting services
//!
//! Decides when a starting service can accept traffic: either by probing a
//! health endpoint, or by waiting out a configured warm-up period. A probe
//! distinguishes an unreachable endpoint (the service is still coming up, so
//! polling continues until the deadline) from a definitive non-2xx answer
//! (the attempt fails immediately and the startup retry policy takes over).
//! The prober is stateless; callers supply the policy, the deadline, and a
//! cancellation token, and probes return promptly on cancellation.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound for a single probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How readiness is decided for one startup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Poll this URL until any 2xx
    HealthPoll(String),
    /// Wait exactly this long, then declare ready
    WarmUp(Duration),
}

/// Result of waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service is ready to accept traffic
    Ready,
    /// The health endpoint answered with a non-2xx status
    Unready(u16),
    /// The deadline passed without reaching the endpoint
    DeadlineExceeded,
    /// The caller's cancellation token fired
    Cancelled,
}

enum ProbeResult {
    Ready,
    Unready(u16),
    Unreachable,
}

/// Stateless readiness prober.
pub struct ReadinessProber {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl ReadinessProber {
    pub fn new(poll_interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            poll_interval,
        }
    }

    /// Prober with a custom HTTP client (for testing).
    pub fn with_client(client: reqwest::Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Wait until the policy resolves, the deadline passes, or `cancel`
    /// fires.
    pub async fn wait_ready(
        &self,
        policy: &ReadinessPolicy,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        match policy {
            ReadinessPolicy::HealthPoll(url) => self.poll_health(url, deadline, cancel).await,
            ReadinessPolicy::WarmUp(warmup) => self.warm_up(*warmup, cancel).await,
        }
    }

    async fn poll_health(
        &self,
        url: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        loop {
            if cancel.is_cancelled() {
                return ProbeOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                return ProbeOutcome::DeadlineExceeded;
            }

            tokio::select! {
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                result = self.probe(url) => {
                    match result {
                        ProbeResult::Ready => return ProbeOutcome::Ready,
                        ProbeResult::Unready(status) => return ProbeOutcome::Unready(status),
                        ProbeResult::Unreachable => {}
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One probe round for the status endpoint's opportunistic check.
    pub async fn probe_once(&self, url: &str) -> bool {
        matches!(self.probe(url).await, ProbeResult::Ready)
    }

    /// HEAD first, falling back to GET when the endpoint rejects HEAD
    /// outright. Any 2xx counts as ready.
    async fn probe(&self, url: &str) -> ProbeResult {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Ready,
            Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                match self.client.get(url).send().await {
                    Ok(resp) if resp.status().is_success() => ProbeResult::Ready,
                    Ok(resp) => ProbeResult::Unready(resp.status().as_u16()),
                    Err(e) => {
                        tracing::debug!(url, error = %e, "Readiness GET probe failed");
                        ProbeResult::Unreachable
                    }
                }
            }
            Ok(resp) => {
                tracing::debug!(url, status = %resp.status(), "Readiness probe not ready");
                ProbeResult::Unready(resp.status().as_u16())
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "Readiness HEAD probe failed");
                ProbeResult::Unreachable
            }
        }
    }

    async fn warm_up(&self, warmup: Duration, cancel: &CancellationToken) -> ProbeOutcome {
        tokio::select! {
            _ = cancel.cancelled() => ProbeOutcome::Cancelled,
            _ = tokio::time::sleep(warmup) => ProbeOutcome::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prober() -> ReadinessProber {
        ReadinessProber::new(Duration::from_millis(10))
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn warmup_zero_is_ready_after_one_tick() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::WarmUp(Duration::ZERO);
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn warmup_waits_configured_duration() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::WarmUp(Duration::from_millis(50));
        let start = Instant::now();
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn warmup_cancelled_returns_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = ReadinessPolicy::WarmUp(Duration::from_secs(5));
        let start = Instant::now();
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn healthy_endpoint_is_ready() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::HealthPoll(format!("{}/health", server.uri()));
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn definitive_error_status_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::HealthPoll(format!("{}/health", server.uri()));
        let start = Instant::now();
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Unready(500));
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "a definitive answer must not wait for the deadline"
        );
    }

    #[tokio::test]
    async fn head_rejected_falls_back_to_get() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::HealthPoll(format!("{}/health", server.uri()));
        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn unreachable_endpoint_polls_until_deadline() {
        let cancel = CancellationToken::new();
        // Port 1 refuses connections immediately
        let policy = ReadinessPolicy::HealthPoll("http://127.0.0.1:1/health".to_string());
        let outcome = prober()
            .wait_ready(&policy, Instant::now() + Duration::from_millis(80), &cancel)
            .await;
        assert_eq!(outcome, ProbeOutcome::DeadlineExceeded);
    }

    #[tokio::test]
    async fn expired_deadline_short_circuits() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::HealthPoll("http://127.0.0.1:1/health".to_string());
        let outcome = prober().wait_ready(&policy, Instant::now(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::DeadlineExceeded);
    }

    #[tokio::test]
    async fn cancellation_interrupts_polling() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::HealthPoll("http://127.0.0.1:1/health".to_string());

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let outcome = prober().wait_ready(&policy, far_deadline(), &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }
}
