//! Round-robin load balancer with passive health tracking

use super::{RequestContext, Resolution, RouteReason, RoutingStrategy};
use crate::config::ServiceConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Consecutive failures before an instance is taken out of rotation.
const FAILURE_THRESHOLD: u32 = 3;

/// Passive health record for one instance URL, fed by proxy outcomes.
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_probe_at: None,
            last_failure_at: None,
        }
    }
}

/// Round-robin selection over a service's instances, skipping instances the
/// proxy has reported unhealthy. When every instance is unhealthy, the
/// least-recently-failed one is tried anyway.
pub struct LoadBalancer {
    /// Per-service rotation cursor
    cursors: DashMap<String, AtomicU64>,
    /// Per-URL health, shared across services that list the same instance
    health: DashMap<String, InstanceHealth>,
    failure_threshold: u32,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::with_threshold(FAILURE_THRESHOLD)
    }

    pub fn with_threshold(failure_threshold: u32) -> Self {
        Self {
            cursors: DashMap::new(),
            health: DashMap::new(),
            failure_threshold,
        }
    }

    /// Health snapshot for an instance URL. Instances never seen by the
    /// proxy are healthy by default.
    pub fn health_of(&self, url: &str) -> InstanceHealth {
        self.health
            .get(url)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    fn is_healthy(&self, url: &str) -> bool {
        self.health.get(url).map(|h| h.healthy).unwrap_or(true)
    }

    fn next_index(&self, service_id: &str, len: usize) -> usize {
        let cursor = self
            .cursors
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        (cursor.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
    }

    /// The proxy observed a 2xx/3xx from `url`.
    pub fn report_success(&self, url: &str) {
        let mut health = self.health.entry(url.to_string()).or_default();
        let was_unhealthy = !health.healthy;
        health.healthy = true;
        health.consecutive_failures = 0;
        health.last_probe_at = Some(Instant::now());
        if was_unhealthy {
            tracing::info!(url, "Instance recovered");
        }
    }

    /// The proxy observed a transport error or a 5xx from `url`.
    pub fn report_failure(&self, url: &str) {
        let mut health = self.health.entry(url.to_string()).or_default();
        health.consecutive_failures += 1;
        health.last_probe_at = Some(Instant::now());
        health.last_failure_at = Some(Instant::now());
        if health.healthy && health.consecutive_failures >= self.failure_threshold {
            health.healthy = false;
            tracing::warn!(
                url,
                failures = health.consecutive_failures,
                "Instance marked unhealthy"
            );
        }
    }
}

impl RoutingStrategy for LoadBalancer {
    fn name(&self) -> &'static str {
        "load_balancer"
    }

    fn resolve(
        &self,
        service_id: &str,
        _ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<Resolution> {
        if config.instances.is_empty() {
            return None;
        }

        // Insertion order is preserved: healthy candidates keep the order
        // they appear in the configuration.
        let healthy: Vec<&str> = config
            .instances
            .iter()
            .map(|i| i.url.as_str())
            .filter(|url| self.is_healthy(url))
            .collect();

        if healthy.is_empty() {
            // All unhealthy: try the least-recently-failed one anyway
            let url = config
                .instances
                .iter()
                .map(|i| i.url.as_str())
                // Earliest failure instant first; never-failed sorts before all
                .min_by_key(|url| self.health.get(*url).and_then(|h| h.last_failure_at))?
                .to_string();
            tracing::warn!(service_id, url = %url, "All instances unhealthy; trying least recently failed");
            return Some(Resolution {
                url,
                reason: RouteReason::UnhealthySkipped,
            });
        }

        let index = self.next_index(service_id, healthy.len());
        Some(Resolution {
            url: healthy[index].to_string(),
            reason: RouteReason::LbSelected,
        })
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use axum::http::{HeaderMap, Method};

    fn instance(url: &str) -> InstanceConfig {
        InstanceConfig {
            url: url.to_string(),
            weight: 1,
            region: None,
            tags: Vec::new(),
        }
    }

    fn config(urls: &[&str]) -> ServiceConfig {
        ServiceConfig {
            service_id: "svc".to_string(),
            base_url: "http://base:8000".to_string(),
            instances: urls.iter().map(|u| instance(u)).collect(),
            ..ServiceConfig::default()
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "/x", HeaderMap::new())
    }

    #[test]
    fn test_no_instances_declines() {
        let lb = LoadBalancer::new();
        assert!(lb.resolve("svc", &ctx(), &config(&[])).is_none());
    }

    #[test]
    fn test_round_robin_rotates_in_config_order() {
        let lb = LoadBalancer::new();
        let config = config(&["http://a", "http://b", "http://c"]);

        let picks: Vec<String> = (0..6)
            .map(|_| lb.resolve("svc", &ctx(), &config).unwrap().url)
            .collect();
        assert_eq!(
            picks,
            vec!["http://a", "http://b", "http://c", "http://a", "http://b", "http://c"]
        );
    }

    #[test]
    fn test_rotation_is_per_service() {
        let lb = LoadBalancer::new();
        let config = config(&["http://a", "http://b"]);

        assert_eq!(lb.resolve("svc1", &ctx(), &config).unwrap().url, "http://a");
        assert_eq!(lb.resolve("svc2", &ctx(), &config).unwrap().url, "http://a");
        assert_eq!(lb.resolve("svc1", &ctx(), &config).unwrap().url, "http://b");
    }

    #[test]
    fn test_unhealthy_instance_skipped_after_threshold() {
        let lb = LoadBalancer::new();
        let config = config(&["http://a", "http://b"]);

        for _ in 0..3 {
            lb.report_failure("http://a");
        }
        assert!(!lb.health_of("http://a").healthy);

        for _ in 0..4 {
            let pick = lb.resolve("svc", &ctx(), &config).unwrap();
            assert_eq!(pick.url, "http://b");
            assert_eq!(pick.reason, RouteReason::LbSelected);
        }
    }

    #[test]
    fn test_failures_below_threshold_keep_instance() {
        let lb = LoadBalancer::new();
        lb.report_failure("http://a");
        lb.report_failure("http://a");
        assert!(lb.health_of("http://a").healthy);
        assert_eq!(lb.health_of("http://a").consecutive_failures, 2);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let lb = LoadBalancer::new();
        for _ in 0..3 {
            lb.report_failure("http://a");
        }
        assert!(!lb.health_of("http://a").healthy);

        lb.report_success("http://a");
        let health = lb.health_of("http://a");
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_all_unhealthy_picks_least_recently_failed() {
        let lb = LoadBalancer::new();
        let config = config(&["http://a", "http://b"]);

        for _ in 0..3 {
            lb.report_failure("http://a");
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        for _ in 0..3 {
            lb.report_failure("http://b");
        }

        let pick = lb.resolve("svc", &ctx(), &config).unwrap();
        assert_eq!(pick.url, "http://a");
        assert_eq!(pick.reason, RouteReason::UnhealthySkipped);
    }
}
