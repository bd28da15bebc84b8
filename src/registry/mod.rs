//! Service Registry
//!
//! Thread-safe map of `service_id → (ServiceConfig, ServiceState, RequestQueue)`.
//! The sole source of truth for the per-service state machine: every state
//! transition happens through [`ServiceRegistry::update_state`] under the
//! per-service lock.

mod error;
mod service;

pub use error::RegistryError;
pub use service::{Lifecycle, Readiness, ServiceState, ServiceView};

use crate::config::{HestiaConfig, ServiceConfig};
use crate::queue::RequestQueue;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};

/// One registered service: configuration, live state, and its request queue.
pub struct ServiceEntry {
    config: RwLock<ServiceConfig>,
    state: Mutex<ServiceState>,
    pub queue: RequestQueue,
}

impl ServiceEntry {
    fn new(config: ServiceConfig) -> Self {
        let queue = RequestQueue::new(config.service_id.clone(), config.queue_size);
        Self {
            config: RwLock::new(config),
            state: Mutex::new(ServiceState::new()),
            queue,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServiceConfig {
        self.config.read().unwrap().clone()
    }

    /// Run `f` under this service's state lock.
    ///
    /// Callers must not perform I/O inside `f`.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut ServiceState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// The base URL requests should currently be proxied to: the fallback
    /// URL after a fallback startup succeeded, the primary otherwise.
    pub fn effective_base_url(&self) -> String {
        let active = self.update_state(|s| s.active_base_url.clone());
        active.unwrap_or_else(|| self.config.read().unwrap().base_url.clone())
    }

    /// Serializable snapshot for the status endpoint.
    pub fn view(&self) -> ServiceView {
        let config = self.config.read().unwrap();
        let (lifecycle, readiness, startup_error) = {
            let state = self.state.lock().unwrap();
            (state.lifecycle, state.readiness, state.startup_error.clone())
        };
        ServiceView {
            service_id: config.service_id.clone(),
            state: lifecycle,
            readiness,
            queue_pending: self.queue.depth(),
            machine_id: config
                .remote
                .as_ref()
                .filter(|r| r.enabled)
                .map(|r| r.machine_id.clone()),
            startup_error,
            observed_at: chrono::Utc::now(),
        }
    }
}

/// Registry of all managed services.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
    default_service: RwLock<Option<String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            default_service: RwLock::new(None),
        }
    }

    /// Build a registry from configuration. Each service starts Cold.
    pub fn from_config(config: &HestiaConfig) -> Self {
        let registry = Self::new();
        *registry.default_service.write().unwrap() = config.server.default_service.clone();
        for service in config.services.values() {
            registry
                .services
                .insert(service.service_id.clone(), Arc::new(ServiceEntry::new(service.clone())));
        }
        registry
    }

    /// Look up a configured service.
    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(service_id).map(|e| Arc::clone(e.value()))
    }

    /// Look up a service for the transparent-proxy path.
    ///
    /// Unknown ids synthesize an entry from the configured default service so
    /// an unmodified client's first call still proceeds; the unknown id still
    /// namespaces its own state and queue. With no default configured the
    /// lookup fails.
    pub fn resolve(&self, service_id: &str) -> Result<Arc<ServiceEntry>, RegistryError> {
        if let Some(entry) = self.get(service_id) {
            return Ok(entry);
        }

        let default_id = self.default_service.read().unwrap().clone();
        let Some(default_id) = default_id else {
            return Err(RegistryError::ServiceNotFound(service_id.to_string()));
        };
        let Some(default_entry) = self.get(&default_id) else {
            return Err(RegistryError::ServiceNotFound(service_id.to_string()));
        };

        let mut config = default_entry.config();
        config.service_id = service_id.to_string();
        tracing::info!(
            service_id,
            default = %default_id,
            "Synthesizing service entry from default service"
        );

        let entry = self
            .services
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(ServiceEntry::new(config)));
        Ok(Arc::clone(entry.value()))
    }

    /// All registered services in id order.
    pub fn list(&self) -> Vec<Arc<ServiceEntry>> {
        let mut entries: Vec<_> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, e)| e).collect()
    }

    /// Run `f` under the named service's state lock.
    pub fn update_state<R>(
        &self,
        service_id: &str,
        f: impl FnOnce(&mut ServiceState) -> R,
    ) -> Option<R> {
        self.get(service_id).map(|entry| entry.update_state(f))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Apply a reloaded configuration.
    ///
    /// Configs are replaced in place and live state is preserved. A queue
    /// shrunk below its current depth evicts the excess with a reject. New
    /// services are added Cold; services gone from the config are removed
    /// after their queue is drained.
    pub fn reload(&self, config: &HestiaConfig) {
        *self.default_service.write().unwrap() = config.server.default_service.clone();

        for service in config.services.values() {
            match self.get(&service.service_id) {
                Some(entry) => {
                    let evicted = entry.queue.resize(service.queue_size);
                    if evicted > 0 {
                        tracing::warn!(
                            service_id = %service.service_id,
                            evicted,
                            "Queue shrunk on reload; evicted excess entries"
                        );
                    }
                    *entry.config.write().unwrap() = service.clone();
                }
                None => {
                    self.services.insert(
                        service.service_id.clone(),
                        Arc::new(ServiceEntry::new(service.clone())),
                    );
                }
            }
        }

        let stale: Vec<String> = self
            .services
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !config.services.contains_key(id))
            .collect();
        for id in stale {
            if let Some((_, entry)) = self.services.remove(&id) {
                entry.queue.shutdown();
                tracing::info!(service_id = %id, "Service removed on reload");
            }
        }
    }

    /// Drain every queue with a shutdown signal.
    pub fn shutdown_all_queues(&self) {
        for entry in self.services.iter() {
            entry.value().queue.shutdown();
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_config(ids: &[&str]) -> HestiaConfig {
        let mut services = BTreeMap::new();
        for id in ids {
            services.insert(
                id.to_string(),
                ServiceConfig {
                    service_id: id.to_string(),
                    base_url: format!("http://{id}:8000"),
                    ..ServiceConfig::default()
                },
            );
        }
        HestiaConfig {
            services,
            ..HestiaConfig::default()
        }
    }

    #[test]
    fn test_from_config_registers_services_cold() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a", "svc-b"]));
        assert_eq!(registry.len(), 2);

        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| {
            assert_eq!(s.lifecycle, Lifecycle::Cold);
            assert_eq!(s.readiness, Readiness::NotReady);
        });
    }

    #[test]
    fn test_unknown_service_without_default_fails() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a"]));
        assert!(matches!(
            registry.resolve("ghost"),
            Err(RegistryError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_service_synthesized_from_default() {
        let mut config = make_config(&["svc-a"]);
        config.server.default_service = Some("svc-a".to_string());
        let registry = ServiceRegistry::from_config(&config);

        let entry = registry.resolve("ghost").unwrap();
        let cfg = entry.config();
        assert_eq!(cfg.service_id, "ghost");
        assert_eq!(cfg.base_url, "http://svc-a:8000");

        // The synthetic entry is namespaced: its state is independent
        entry.update_state(|s| s.lifecycle = Lifecycle::Hot);
        registry
            .get("svc-a")
            .unwrap()
            .update_state(|s| assert_eq!(s.lifecycle, Lifecycle::Cold));
    }

    #[test]
    fn test_update_state_under_lock() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a"]));
        let epoch = registry
            .update_state("svc-a", |s| {
                s.lifecycle = Lifecycle::Starting;
                s.startup_epoch += 1;
                s.startup_epoch
            })
            .unwrap();
        assert_eq!(epoch, 1);
    }

    #[test]
    fn test_effective_base_url_prefers_active() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a"]));
        let entry = registry.get("svc-a").unwrap();
        assert_eq!(entry.effective_base_url(), "http://svc-a:8000");

        entry.update_state(|s| s.active_base_url = Some("http://fb:9000".to_string()));
        assert_eq!(entry.effective_base_url(), "http://fb:9000");

        entry.update_state(|s| s.settle_cold());
        assert_eq!(entry.effective_base_url(), "http://svc-a:8000");
    }

    #[test]
    fn test_view_reports_queue_depth() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a"]));
        let entry = registry.get("svc-a").unwrap();
        let _rx = entry.queue.enqueue().unwrap();

        let view = entry.view();
        assert_eq!(view.service_id, "svc-a");
        assert_eq!(view.queue_pending, 1);
        assert_eq!(view.state, Lifecycle::Cold);
    }

    #[tokio::test]
    async fn test_reload_preserves_state_and_shrinks_queue() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a"]));
        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| s.lifecycle = Lifecycle::Hot);

        let _rx1 = entry.queue.enqueue().unwrap();
        let rx2 = entry.queue.enqueue().unwrap();

        let mut new_config = make_config(&["svc-a"]);
        new_config.services.get_mut("svc-a").unwrap().queue_size = 1;
        registry.reload(&new_config);

        // State preserved, queue shrunk, newest entry rejected
        entry.update_state(|s| assert_eq!(s.lifecycle, Lifecycle::Hot));
        assert_eq!(entry.queue.depth(), 1);
        assert_eq!(rx2.await.unwrap(), crate::queue::QueueSignal::Rejected);
    }

    #[tokio::test]
    async fn test_reload_removes_unconfigured_service() {
        let registry = ServiceRegistry::from_config(&make_config(&["svc-a", "svc-b"]));
        let gone = registry.get("svc-b").unwrap();
        let rx = gone.queue.enqueue().unwrap();

        registry.reload(&make_config(&["svc-a"]));
        assert!(registry.get("svc-b").is_none());
        assert_eq!(
            rx.await.unwrap(),
            crate::queue::QueueSignal::GatewayShutdown
        );
    }
}
