//! Model-aware routing

use super::{LoadBalancer, RequestContext, Resolution, RouteReason, RoutingStrategy};
use crate::config::ServiceConfig;
use std::sync::Arc;

/// Routes by the model named in the request body.
///
/// If `routing.by_model` maps the peeked model to an instance URL, that
/// instance is used. Misses delegate to the load balancer; with no instances
/// configured the service base URL applies.
pub struct ModelRouter {
    load_balancer: Arc<LoadBalancer>,
}

impl ModelRouter {
    pub fn new(load_balancer: Arc<LoadBalancer>) -> Self {
        Self { load_balancer }
    }
}

impl RoutingStrategy for ModelRouter {
    fn name(&self) -> &'static str {
        "model_router"
    }

    fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<Resolution> {
        let model_key = config.routing.model_key();
        let model = ctx.body_field(model_key).or_else(|| ctx.body_field("model"));

        if let Some(model) = model {
            if let Some(url) = config.routing.by_model.get(model) {
                tracing::debug!(service_id, model, url = %url, "Model mapping hit");
                return Some(Resolution {
                    url: url.clone(),
                    reason: RouteReason::MappingHit,
                });
            }
        }

        self.load_balancer.resolve(service_id, ctx, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceConfig, RoutingTable};
    use axum::http::{HeaderMap, Method};
    use std::collections::HashMap;

    fn router() -> ModelRouter {
        ModelRouter::new(Arc::new(LoadBalancer::new()))
    }

    fn config_with_mapping() -> ServiceConfig {
        let mut by_model = HashMap::new();
        by_model.insert("m1".to_string(), "http://u1".to_string());
        by_model.insert("m2".to_string(), "http://u2".to_string());
        ServiceConfig {
            service_id: "svc-b".to_string(),
            base_url: "http://base:8000".to_string(),
            routing: RoutingTable {
                model_key: None,
                by_model,
            },
            instances: vec![InstanceConfig {
                url: "http://u3".to_string(),
                weight: 1,
                region: None,
                tags: Vec::new(),
            }],
            ..ServiceConfig::default()
        }
    }

    fn ctx_with_model(model: &str) -> RequestContext {
        RequestContext::new(Method::POST, "/generate", HeaderMap::new())
            .with_body_peek(Some(serde_json::json!({ "model": model })))
    }

    #[test]
    fn test_mapping_hit() {
        let resolution = router()
            .resolve("svc-b", &ctx_with_model("m1"), &config_with_mapping())
            .unwrap();
        assert_eq!(resolution.url, "http://u1");
        assert_eq!(resolution.reason, RouteReason::MappingHit);
    }

    #[test]
    fn test_unmapped_model_delegates_to_load_balancer() {
        let resolution = router()
            .resolve("svc-b", &ctx_with_model("mX"), &config_with_mapping())
            .unwrap();
        assert_eq!(resolution.url, "http://u3");
        assert_eq!(resolution.reason, RouteReason::LbSelected);
    }

    #[test]
    fn test_no_body_delegates_to_load_balancer() {
        let ctx = RequestContext::new(Method::GET, "/x", HeaderMap::new());
        let resolution = router()
            .resolve("svc-b", &ctx, &config_with_mapping())
            .unwrap();
        assert_eq!(resolution.reason, RouteReason::LbSelected);
    }

    #[test]
    fn test_no_instances_and_no_mapping_declines() {
        let mut config = config_with_mapping();
        config.instances.clear();
        let result = router().resolve("svc-b", &ctx_with_model("mX"), &config);
        assert!(result.is_none());
    }

    #[test]
    fn test_custom_model_key() {
        let mut config = config_with_mapping();
        config.routing.model_key = Some("engine".to_string());

        let ctx = RequestContext::new(Method::POST, "/generate", HeaderMap::new())
            .with_body_peek(Some(serde_json::json!({ "engine": "m2" })));
        let resolution = router().resolve("svc-b", &ctx, &config).unwrap();
        assert_eq!(resolution.url, "http://u2");
        assert_eq!(resolution.reason, RouteReason::MappingHit);
    }
}
