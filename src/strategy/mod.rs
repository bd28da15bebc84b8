//! Routing strategies for upstream selection
//!
//! A strategy maps a request context to an upstream URL. Strategies are
//! registered by name in a map at startup; a service without a strategy uses
//! its base URL directly.

mod load_balancer;
mod model_router;

pub use load_balancer::{InstanceHealth, LoadBalancer};
pub use model_router::ModelRouter;

use crate::config::ServiceConfig;
use axum::http::{HeaderMap, Method};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Why an upstream was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// The routing table mapped the request directly to an instance
    MappingHit,
    /// The load balancer picked a healthy instance
    LbSelected,
    /// No strategy or no instances; the service base URL is used
    FallbackBaseUrl,
    /// Every instance was unhealthy; the least-recently-failed one is tried
    UnhealthySkipped,
}

/// A resolved upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub url: String,
    pub reason: RouteReason,
}

/// Read-only view of the request handed to strategies.
pub struct RequestContext {
    pub method: Method,
    /// Path relative to the service, always with a leading slash
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Shallow parse of a small JSON body, when available
    pub body_peek: Option<serde_json::Value>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers,
            body_peek: None,
        }
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body_peek(mut self, peek: Option<serde_json::Value>) -> Self {
        self.body_peek = peek;
        self
    }

    /// Value of `key` in the peeked body, if it is a string.
    pub fn body_field(&self, key: &str) -> Option<&str> {
        self.body_peek.as_ref()?.get(key)?.as_str()
    }
}

/// A named routing policy.
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick an upstream for the request, or None to fall back to the
    /// service's base URL.
    fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<Resolution>;
}

/// Name→strategy map plus the shared passive-health tracker the proxy
/// reports into. Built-ins are registered at startup.
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn RoutingStrategy>>,
    health: Arc<LoadBalancer>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            health: Arc::new(LoadBalancer::new()),
        }
    }

    /// Registry with the default strategies: `load_balancer` and
    /// `model_router` (which delegates misses to the load balancer). Both
    /// share one instance-health tracker.
    pub fn with_defaults() -> Self {
        let lb = Arc::new(LoadBalancer::new());
        let mut registry = Self {
            strategies: HashMap::new(),
            health: Arc::clone(&lb),
        };
        registry.register(Arc::clone(&lb) as Arc<dyn RoutingStrategy>);
        registry.register(Arc::new(ModelRouter::new(lb)));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn RoutingStrategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RoutingStrategy>> {
        self.strategies.get(name).map(Arc::clone)
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.strategies.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Resolve an upstream for the request.
    ///
    /// A missing or unknown strategy, and a strategy that declines, both fall
    /// back to `base_url` (which the caller may have overridden with the
    /// fallback URL after a fallback startup).
    pub fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
        base_url: &str,
    ) -> Resolution {
        if let Some(name) = &config.strategy_name {
            match self.get(name) {
                Some(strategy) => {
                    if let Some(resolution) = strategy.resolve(service_id, ctx, config) {
                        return resolution;
                    }
                }
                None => {
                    tracing::warn!(service_id, strategy = %name, "Unknown strategy; using base URL");
                }
            }
        }

        Resolution {
            url: base_url.to_string(),
            reason: RouteReason::FallbackBaseUrl,
        }
    }

    /// Feed a proxy outcome into the instance-health tracker.
    pub fn report(&self, url: &str, success: bool) {
        if success {
            self.health.report_success(url);
        } else {
            self.health.report_failure(url);
        }
    }

    /// The shared instance-health tracker.
    pub fn health(&self) -> &Arc<LoadBalancer> {
        &self.health
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "/x", HeaderMap::new())
    }

    #[test]
    fn test_defaults_register_both_strategies() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["load_balancer", "model_router"]);
    }

    #[test]
    fn test_no_strategy_uses_base_url() {
        let registry = StrategyRegistry::with_defaults();
        let config = ServiceConfig {
            base_url: "http://svc:8000".to_string(),
            ..ServiceConfig::default()
        };

        let resolution = registry.resolve("svc", &ctx(), &config, "http://svc:8000");
        assert_eq!(resolution.url, "http://svc:8000");
        assert_eq!(resolution.reason, RouteReason::FallbackBaseUrl);
    }

    #[test]
    fn test_unknown_strategy_falls_back() {
        let registry = StrategyRegistry::with_defaults();
        let config = ServiceConfig {
            base_url: "http://svc:8000".to_string(),
            strategy_name: Some("tarot_cards".to_string()),
            ..ServiceConfig::default()
        };

        let resolution = registry.resolve("svc", &ctx(), &config, "http://svc:8000");
        assert_eq!(resolution.reason, RouteReason::FallbackBaseUrl);
    }

    #[test]
    fn test_resolve_honors_effective_base_url() {
        let registry = StrategyRegistry::with_defaults();
        let config = ServiceConfig {
            base_url: "http://svc:8000".to_string(),
            ..ServiceConfig::default()
        };

        // After a fallback startup the caller passes the fallback URL
        let resolution = registry.resolve("svc", &ctx(), &config, "http://fb:9000");
        assert_eq!(resolution.url, "http://fb:9000");
    }

    #[test]
    fn test_body_field_reads_peeked_json() {
        let ctx = ctx().with_body_peek(Some(serde_json::json!({"model": "m1", "n": 3})));
        assert_eq!(ctx.body_field("model"), Some("m1"));
        assert_eq!(ctx.body_field("n"), None); // not a string
        assert_eq!(ctx.body_field("missing"), None);
    }
}
