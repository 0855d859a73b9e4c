//! In-memory service registry.
//!
//! Keeps the catalogue of upstream instances per service name. The
//! registry is the single owner of instance state: mutations to
//! status flow only through [`Registry::update_status`], called by the
//! health checker or (in principle) by an operator surface.
//!
//! Grounded on `gateway/config/service_registry.py::ServiceRegistry`
//! for the operation contract, adapted to a `RwLock<HashMap<...>>` per
//! the teacher crate's locking idiom in `services/load_balancer.rs`.

use crate::models::instance::{Instance, ServiceStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Thread-safe catalogue of services and their instances.
///
/// All operations take `&self`; interior mutability is via a single
/// `RwLock` over the service map. The critical sections are small
/// (vector search/push/remove over a handful of instances) so a
/// single lock per service map is acceptable contention, matching the
/// teacher's load balancer locking granularity.
pub struct Registry {
    services: RwLock<HashMap<String, Vec<Instance>>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry { services: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Registers a new instance, returning its fresh id.
    pub fn register(
        &self,
        service: &str,
        base_url: &str,
        health_check_path: &str,
        weight: u32,
        metadata: HashMap<String, String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = Instance::new(id, service, base_url, health_check_path, weight, metadata, id);
        let mut services = self.services.write().unwrap();
        services.entry(service.to_string()).or_default().push(instance);
        log::info!("registered instance {id} for service '{service}' at {base_url}");
        id
    }

    /// Removes an instance; drops the service entry entirely if it was
    /// the last instance.
    pub fn unregister(&self, service: &str, id: u64) -> bool {
        let mut services = self.services.write().unwrap();
        let Some(instances) = services.get_mut(service) else { return false };
        let before = instances.len();
        instances.retain(|i| i.id != id);
        let removed = instances.len() != before;
        if instances.is_empty() {
            services.remove(service);
        }
        if removed {
            log::info!("unregistered instance {id} from service '{service}'");
        }
        removed
    }

    /// All enabled instances of a service, any health status.
    pub fn list(&self, service: &str) -> Vec<Instance> {
        let services = self.services.read().unwrap();
        services
            .get(service)
            .map(|instances| instances.iter().filter(|i| i.enabled).cloned().collect())
            .unwrap_or_default()
    }

    /// Enabled instances currently marked healthy.
    pub fn healthy(&self, service: &str) -> Vec<Instance> {
        let services = self.services.read().unwrap();
        services
            .get(service)
            .map(|instances| instances.iter().filter(|i| i.is_healthy()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn enable(&self, service: &str, id: u64) -> bool {
        self.mutate(service, id, |instance| instance.enable())
    }

    pub fn disable(&self, service: &str, id: u64) -> bool {
        self.mutate(service, id, |instance| instance.disable())
    }

    /// Updates status, stamping `last_check` and adjusting the
    /// success/failure counters. A no-op (returns `false`) if the
    /// instance was unregistered since the check that produced this
    /// update was issued.
    pub fn update_status(&self, service: &str, id: u64, status: ServiceStatus) -> bool {
        self.mutate(service, id, |instance| instance.apply_status(status, chrono::Utc::now()))
    }

    fn mutate(&self, service: &str, id: u64, f: impl FnOnce(&mut Instance)) -> bool {
        let mut services = self.services.write().unwrap();
        let Some(instances) = services.get_mut(service) else { return false };
        let Some(instance) = instances.iter_mut().find(|i| i.id == id) else { return false };
        f(instance);
        true
    }

    /// All enabled instances across all services, for the health
    /// checker's tick — it needs a point-in-time snapshot to check
    /// against, separate from the lock it takes to write results back.
    pub fn snapshot_enabled(&self) -> Vec<Instance> {
        let services = self.services.read().unwrap();
        services.values().flatten().filter(|i| i.enabled).cloned().collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let services = self.services.read().unwrap();
        services.keys().cloned().collect()
    }

    pub fn service_count(&self) -> usize {
        self.services.read().unwrap().len()
    }

    pub fn instance_count(&self) -> usize {
        self.services.read().unwrap().values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_list_returns_the_instance() {
        let registry = Registry::new();
        let id = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        let instances = registry.list("auth");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, id);
    }

    #[test]
    fn register_then_unregister_leaves_registry_empty() {
        let registry = Registry::new();
        let id = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        assert!(registry.unregister("auth", id));
        assert_eq!(registry.list("auth").len(), 0);
        assert_eq!(registry.service_count(), 0);
    }

    #[test]
    fn healthy_excludes_disabled_and_unhealthy() {
        let registry = Registry::new();
        let id1 = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        let id2 = registry.register("auth", "http://u2:9000", "/", 1, HashMap::new());
        registry.update_status("auth", id1, ServiceStatus::Healthy);
        registry.update_status("auth", id2, ServiceStatus::Unhealthy);
        let healthy = registry.healthy("auth");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, id1);
    }

    #[test]
    fn disable_removes_instance_from_healthy_and_list() {
        let registry = Registry::new();
        let id = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        registry.update_status("auth", id, ServiceStatus::Healthy);
        registry.disable("auth", id);
        assert_eq!(registry.healthy("auth").len(), 0);
        assert_eq!(registry.list("auth").len(), 0);
    }

    #[test]
    fn update_status_on_unregistered_instance_is_a_no_op() {
        let registry = Registry::new();
        let id = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        registry.unregister("auth", id);
        assert!(!registry.update_status("auth", id, ServiceStatus::Healthy));
    }

    #[test]
    fn unregistering_last_instance_removes_service_entry() {
        let registry = Registry::new();
        let id = registry.register("auth", "http://u1:9000", "/", 1, HashMap::new());
        registry.unregister("auth", id);
        assert_eq!(registry.service_names().len(), 0);
    }
}
