//! Metrics collection
//!
//! Counters and histograms are recorded at their call sites through the
//! `metrics` facade; this module owns the Prometheus recorder, computes
//! fleet-state gauges from the service registry, and renders the exposition
//! text for `/v1/metrics`.
//!
//! Tracked series:
//! - `hestia_requests_total{service, status}` / `hestia_request_duration_seconds{service}`
//! - `hestia_startups_total{service, outcome}`
//! - `hestia_idle_shutdowns_total{service}`
//! - `hestia_proxy_retries_total{service}`
//! - `hestia_queue_depth{service}` (gauge, set by the queue)
//! - `hestia_services_total` / `hestia_services_hot` (gauges, computed here)

use crate::registry::{Lifecycle, ServiceRegistry};
use std::sync::Arc;
use std::time::Instant;

// Re-export for tests that need a detached recorder
pub use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the global Prometheus recorder.
pub fn setup_metrics(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, Box<dyn std::error::Error>> {
    use metrics_exporter_prometheus::Matcher;

    let duration_buckets = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("hestia_request_duration_seconds".to_string()),
            duration_buckets,
        )?
        .install_recorder()?;

    Ok(handle)
}

/// Computes registry-derived gauges and renders the exposition text.
pub struct MetricsCollector {
    registry: Arc<ServiceRegistry>,
    start_time: Instant,
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        start_time: Instant,
        prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        Self {
            registry,
            start_time,
            prometheus_handle,
        }
    }

    /// Refresh fleet-state gauges from the registry.
    pub fn update_fleet_gauges(&self) {
        let entries = self.registry.list();
        metrics::gauge!("hestia_services_total").set(entries.len() as f64);

        let mut hot = 0usize;
        for entry in &entries {
            let (lifecycle, service_id) = {
                let view = entry.view();
                (view.state, view.service_id)
            };
            if lifecycle == Lifecycle::Hot {
                hot += 1;
            }
            metrics::gauge!("hestia_queue_depth", "service" => service_id)
                .set(entry.queue.depth() as f64);
        }
        metrics::gauge!("hestia_services_hot").set(hot as f64);
    }

    /// Prometheus exposition text.
    pub fn render_metrics(&self) -> String {
        self.prometheus_handle.render()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Record one completed proxied request.
pub fn record_request(service_id: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "hestia_requests_total",
        "service" => service_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "hestia_request_duration_seconds",
        "service" => service_id.to_string()
    )
    .record(duration_secs);
}
