//! Idle monitor
//!
//! Background sweeper that demotes Hot services to Cold after their
//! configured inactivity window. The Hot→Stopping transition (which also
//! clears readiness) happens under the service lock; the best-effort remote
//! stop runs outside it. Requests arriving during Stopping are queued and
//! re-trigger startup once the service settles Cold.

use crate::executor::RemoteExecutor;
use crate::persistence::{self, MetadataStore};
use crate::registry::{Lifecycle, ServiceEntry, ServiceRegistry};
use crate::startup::StartupOrchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background task sweeping all services for idleness.
pub struct IdleMonitor {
    registry: Arc<ServiceRegistry>,
    orchestrator: Arc<StartupOrchestrator>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    store: Option<Arc<MetadataStore>>,
    interval: Duration,
}

impl IdleMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        orchestrator: Arc<StartupOrchestrator>,
        executor: Option<Arc<dyn RemoteExecutor>>,
        store: Option<Arc<MetadataStore>>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            executor,
            store,
            interval,
        }
    }

    /// Spawn the sweep loop. Resolves when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(interval_ms = self.interval.as_millis() as u64, "Idle monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Idle monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// One pass over all services.
    pub async fn sweep(&self) {
        for entry in self.registry.list() {
            let config = entry.config();
            if config.idle_timeout_ms == 0 {
                continue;
            }

            let idle_limit = Duration::from_millis(config.idle_timeout_ms);
            let demoted = entry.update_state(|state| {
                if state.lifecycle == Lifecycle::Hot && state.idle_for() >= idle_limit {
                    state.begin_stopping();
                    true
                } else {
                    false
                }
            });

            if demoted {
                self.stop_service(&config.service_id, &entry).await;
            }
        }
    }

    /// Finish a Stopping→Cold transition, including the best-effort remote
    /// stop. Also used by the explicit stop endpoint.
    pub async fn stop_service(&self, service_id: &str, entry: &Arc<ServiceEntry>) {
        let config = entry.config();
        tracing::info!(service_id, "Shutting down idle service");

        if let Some(remote) = config.remote.as_ref().filter(|r| r.enabled) {
            if let Some(executor) = &self.executor {
                match executor
                    .stop(
                        service_id,
                        &remote.machine_id,
                        remote.stop_template_id,
                        &HashMap::new(),
                    )
                    .await
                {
                    Ok(handle) => {
                        tracing::debug!(service_id, task_id = %handle.0, "Remote stop task submitted");
                    }
                    Err(e) => {
                        // Best-effort: the transition proceeds regardless
                        tracing::warn!(service_id, error = %e, "Remote stop failed");
                    }
                }
            }
        }

        entry.update_state(|state| {
            if state.lifecycle == Lifecycle::Stopping {
                state.settle_cold();
            }
        });
        metrics::counter!("hestia_idle_shutdowns_total", "service" => service_id.to_string())
            .increment(1);

        if let Some(store) = &self.store {
            persistence::record_status_async(store, service_id.to_string(), "cold", None);
        }

        // Requests that arrived during Stopping are waiting on a fresh start
        if entry.queue.depth() > 0 {
            self.orchestrator.trigger(service_id);
        }
    }
}
