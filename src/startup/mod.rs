//! Startup orchestration
//!
//! Serializes cold starts per service and applies the retry → fallback →
//! error policy. A trigger transitions Cold→Starting under the service lock
//! and spawns one startup task; everyone else just queues. Completion is
//! fenced by the startup epoch so a stale probe can never flip state after a
//! newer startup has begun.

use crate::config::ServiceConfig;
use crate::executor::{self, ExecutorError, RemoteExecutor, TaskStatus};
use crate::persistence::{self, MetadataStore};
use crate::queue::QueueSignal;
use crate::readiness::{ProbeOutcome, ReadinessPolicy, ReadinessProber};
use crate::registry::{Lifecycle, ServiceEntry, ServiceRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

enum AttemptError {
    Failed(String),
    Cancelled,
}

/// Drives cold starts for all services.
pub struct StartupOrchestrator {
    registry: Arc<ServiceRegistry>,
    prober: Arc<ReadinessProber>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    store: Option<Arc<MetadataStore>>,
    cancel: CancellationToken,
}

impl StartupOrchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        prober: Arc<ReadinessProber>,
        executor: Option<Arc<dyn RemoteExecutor>>,
        store: Option<Arc<MetadataStore>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            prober,
            executor,
            store,
            cancel,
        }
    }

    /// Begin a startup if the service is Cold. Returns true when a startup
    /// task was spawned; false when one is already in flight (or the service
    /// is Hot/Stopping/unknown) — callers then simply stay queued.
    pub fn trigger(self: &Arc<Self>, service_id: &str) -> bool {
        let Some(entry) = self.registry.get(service_id) else {
            return false;
        };

        let epoch = entry.update_state(|state| {
            if state.lifecycle != Lifecycle::Cold {
                return None;
            }
            state.lifecycle = Lifecycle::Starting;
            state.startup_epoch += 1;
            state.startup_error = None;
            Some(state.startup_epoch)
        });

        let Some(epoch) = epoch else {
            return false;
        };

        tracing::info!(service_id, epoch, "Startup initiated");
        if let Some(store) = &self.store {
            persistence::record_status_async(store, service_id.to_string(), "starting", None);
        }

        let this = Arc::clone(self);
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            this.run(&service_id, entry, epoch).await;
        });
        true
    }

    async fn run(&self, service_id: &str, entry: Arc<ServiceEntry>, epoch: u64) {
        let config = entry.config();
        let attempts = config.retry_count.max(1);
        let mut first_error: Option<String> = None;
        let mut last_error: Option<String> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.abort_for_shutdown(service_id, &entry, epoch);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)) => {}
                }
            }

            match self.attempt(service_id, &config, &config.base_url, true).await {
                Ok(()) => {
                    self.complete(service_id, &entry, epoch, None);
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    self.abort_for_shutdown(service_id, &entry, epoch);
                    return;
                }
                Err(AttemptError::Failed(reason)) => {
                    tracing::warn!(
                        service_id,
                        attempt,
                        attempts,
                        reason = %reason,
                        "Startup attempt failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(reason.clone());
                    }
                    last_error = Some(reason);
                }
            }
        }

        if let Some(fallback_url) = config.fallback_url.clone() {
            tracing::info!(service_id, fallback = %fallback_url, "Primary attempts exhausted; trying fallback");
            match self.attempt(service_id, &config, &fallback_url, false).await {
                Ok(()) => {
                    self.complete(service_id, &entry, epoch, Some(fallback_url));
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    self.abort_for_shutdown(service_id, &entry, epoch);
                    return;
                }
                Err(AttemptError::Failed(reason)) => {
                    last_error = Some(reason);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| "startup failed".to_string());
        tracing::error!(
            service_id,
            first_error = first_error.as_deref().unwrap_or(&error),
            last_error = %error,
            "Startup failed terminally"
        );
        self.fail(service_id, &entry, epoch, error);
    }

    /// One startup attempt against `base_url`: optional remote start task,
    /// then the readiness policy with the attempt deadline.
    async fn attempt(
        &self,
        service_id: &str,
        config: &ServiceConfig,
        base_url: &str,
        primary: bool,
    ) -> Result<(), AttemptError> {
        if config.remote_enabled() {
            self.run_remote_start(service_id, config).await?;
        }

        let deadline = Instant::now() + Duration::from_secs(config.request_timeout_seconds);
        let policy = readiness_policy(config, base_url, primary);

        match self.prober.wait_ready(&policy, deadline, &self.cancel).await {
            ProbeOutcome::Ready => Ok(()),
            ProbeOutcome::Cancelled => Err(AttemptError::Cancelled),
            ProbeOutcome::Unready(status) => Err(AttemptError::Failed(format!(
                "health probe for {base_url} returned {status}"
            ))),
            ProbeOutcome::DeadlineExceeded => Err(AttemptError::Failed(format!(
                "readiness not reached for {base_url} within {}s",
                config.request_timeout_seconds
            ))),
        }
    }

    async fn run_remote_start(
        &self,
        service_id: &str,
        config: &ServiceConfig,
    ) -> Result<(), AttemptError> {
        let Some(executor) = &self.executor else {
            tracing::warn!(service_id, "Remote start requested but no executor configured");
            return Ok(());
        };
        let Some(remote) = config.remote.as_ref() else {
            return Ok(());
        };

        let handle = executor
            .start(
                service_id,
                &remote.machine_id,
                remote.start_template_id,
                &HashMap::new(),
            )
            .await
            .map_err(|e| AttemptError::Failed(e.to_string()))?;

        let status = executor::wait_for_completion(
            executor.as_ref(),
            &handle,
            Duration::from_secs(remote.task_timeout_s),
            Duration::from_secs(remote.poll_interval_s),
            &self.cancel,
        )
        .await;

        match status {
            Ok(TaskStatus::Success) => Ok(()),
            Ok(TaskStatus::Failed(reason)) => Err(AttemptError::Failed(format!(
                "executor task {} failed: {reason}",
                handle.0
            ))),
            Ok(TaskStatus::Running) => unreachable!("wait_for_completion never returns Running"),
            Err(ExecutorError::Cancelled) => Err(AttemptError::Cancelled),
            Err(e) => Err(AttemptError::Failed(e.to_string())),
        }
    }

    /// Apply a successful startup under the epoch fence, then release the
    /// queue. A stale completion (epoch moved on, or lifecycle no longer
    /// Starting) is discarded.
    fn complete(
        &self,
        service_id: &str,
        entry: &ServiceEntry,
        epoch: u64,
        fallback_url: Option<String>,
    ) {
        let used_fallback = fallback_url.is_some();
        let applied = entry.update_state(|state| {
            if state.startup_epoch != epoch || state.lifecycle != Lifecycle::Starting {
                return false;
            }
            state.lifecycle = Lifecycle::Hot;
            state.readiness = crate::registry::Readiness::Ready;
            state.startup_error = None;
            state.active_base_url = fallback_url.clone();
            state.touch();
            true
        });

        if !applied {
            tracing::debug!(service_id, epoch, "Discarding stale startup completion");
            return;
        }

        let outcome = if used_fallback { "fallback" } else { "success" };
        metrics::counter!("hestia_startups_total", "service" => service_id.to_string(), "outcome" => outcome)
            .increment(1);

        let released = entry.queue.drain_all(QueueSignal::Proceed);
        tracing::info!(service_id, epoch, released, outcome, "Service is hot");

        if let Some(store) = &self.store {
            persistence::record_status_async(
                store,
                service_id.to_string(),
                "hot",
                entry.update_state(|s| s.active_base_url.clone()),
            );
        }
    }

    fn fail(&self, service_id: &str, entry: &ServiceEntry, epoch: u64, error: String) {
        let applied = entry.update_state(|state| {
            if state.startup_epoch != epoch || state.lifecycle != Lifecycle::Starting {
                return false;
            }
            state.settle_cold();
            state.startup_error = Some(error.clone());
            true
        });

        if !applied {
            tracing::debug!(service_id, epoch, "Discarding stale startup failure");
            return;
        }

        metrics::counter!("hestia_startups_total", "service" => service_id.to_string(), "outcome" => "failure")
            .increment(1);
        entry.queue.drain_all(QueueSignal::StartupFailed);

        if let Some(store) = &self.store {
            persistence::record_status_async(store, service_id.to_string(), "cold", None);
        }
    }

    fn abort_for_shutdown(&self, service_id: &str, entry: &ServiceEntry, epoch: u64) {
        tracing::info!(service_id, epoch, "Startup aborted by gateway shutdown");
        entry.update_state(|state| {
            if state.startup_epoch == epoch && state.lifecycle == Lifecycle::Starting {
                state.settle_cold();
            }
        });
        entry.queue.drain_all(QueueSignal::GatewayShutdown);
    }
}

/// Readiness policy for one attempt. Primary attempts probe `health_url`
/// verbatim; fallback attempts re-base the health path onto the fallback
/// authority so the probe reaches the host actually being started.
fn readiness_policy(config: &ServiceConfig, base_url: &str, primary: bool) -> ReadinessPolicy {
    match &config.health_url {
        None => ReadinessPolicy::WarmUp(Duration::from_millis(config.warmup_ms)),
        Some(health_url) if primary => ReadinessPolicy::HealthPoll(health_url.clone()),
        Some(health_url) => {
            let rebased = reqwest::Url::parse(health_url)
                .ok()
                .zip(reqwest::Url::parse(base_url).ok())
                .map(|(health, mut base)| {
                    base.set_path(health.path());
                    base.set_query(health.query());
                    base.to_string()
                })
                .unwrap_or_else(|| health_url.clone());
            ReadinessPolicy::HealthPoll(rebased)
        }
    }
}
