//! The single aggregate owning every gateway subsystem.
//!
//! Grounded on SPEC_FULL.md §9's redesign note: the Python original
//! treats the registry, load balancer, breaker manager, and so on as
//! module-global singletons (`main.py`'s `registry = None` /
//! `discovery = None` / ... pattern). Here one `Gateway` owns all of
//! them and is handed to the HTTP layer at startup; tests build a
//! fresh `Gateway` per case instead of relying on shared process state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::config::GatewayConfig;
use crate::health::HealthChecker;
use crate::metrics::MetricsRegistry;
use crate::registry::Registry;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::load_balancer::LoadBalancer;
use crate::services::proxy::Proxy;
use crate::services::rate_limiter::RateLimiter;

/// Owns the registry, health checker, per-service circuit breakers and
/// load balancers, the rate limiter, the proxy client, and the metrics
/// registry — every piece of mutable state the request pipeline
/// touches.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub health_checker: Arc<HealthChecker>,
    pub rate_limiter: RateLimiter,
    pub proxy: Proxy,
    pub metrics: MetricsRegistry,
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    load_balancers: RwLock<HashMap<String, Arc<LoadBalancer>>>,
}

impl Gateway {
    /// Builds the aggregate and registers every `DEFAULT_BACKENDS`
    /// entry from `config`, matching `main.py`'s `lifespan` startup
    /// sequence. Does not spawn the health-check task — the caller
    /// does that explicitly via [`Gateway::spawn_health_checker`] once
    /// the aggregate is wrapped in an `Arc`.
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        for (service, backend) in &config.default_backends {
            registry.register(service, &backend.url, &backend.health_check, backend.weight, HashMap::new());
        }

        let health_checker = Arc::new(HealthChecker::new(
            registry.clone(),
            config.health_check_interval,
            config.health_check_timeout,
        ));

        let rate_limiter =
            RateLimiter::new(config.rate_limit_strategy, config.rate_limit_requests_per_minute, config.rate_limit_burst_size);

        let proxy = Proxy::new(config.connect_timeout, config.request_timeout);

        Gateway {
            config,
            registry,
            health_checker,
            rate_limiter,
            proxy,
            metrics: MetricsRegistry::new(),
            circuit_breakers: RwLock::new(HashMap::new()),
            load_balancers: RwLock::new(HashMap::new()),
        }
    }

    /// Spawns the periodic health-check sweep. Returns the join handle
    /// so the caller (typically `main`) can hold it for the process
    /// lifetime; dropping or aborting it stops the sweep.
    pub fn spawn_health_checker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.health_checker.clone().spawn()
    }

    /// Returns the circuit breaker cell for `service`, creating it
    /// (lazily, check-lock-check) on first use per SPEC_FULL §9.
    pub fn circuit_breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.read().unwrap().get(service) {
            return breaker.clone();
        }
        let mut breakers = self.circuit_breakers.write().unwrap();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(
                    service.to_string(),
                    CircuitBreakerConfig {
                        failure_threshold: self.config.circuit_breaker_failure_threshold,
                        success_threshold: self.config.circuit_breaker_success_threshold,
                        open_timeout: self.config.circuit_breaker_timeout,
                        half_open_max_calls: self.config.circuit_breaker_half_open_max_calls,
                    },
                )
            })
            .clone()
    }

    /// Returns the load balancer for `service`, creating it (lazily,
    /// check-lock-check) on first use. Every service gets its own
    /// round-robin index and connection-count map.
    pub fn load_balancer(&self, service: &str) -> Arc<LoadBalancer> {
        if let Some(lb) = self.load_balancers.read().unwrap().get(service) {
            return lb.clone();
        }
        let mut balancers = self.load_balancers.write().unwrap();
        balancers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(LoadBalancer::new(self.config.load_balancer_strategy)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::from_env().expect("env defaults must parse");
        config.default_backends = StdHashMap::new();
        config
    }

    #[test]
    fn circuit_breaker_is_created_once_and_reused_per_service() {
        let gateway = Gateway::new(test_config());
        let first = gateway.circuit_breaker("auth");
        let second = gateway.circuit_breaker("auth");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn different_services_get_independent_circuit_breakers() {
        let gateway = Gateway::new(test_config());
        let auth = gateway.circuit_breaker("auth");
        let model = gateway.circuit_breaker("model");
        assert!(!Arc::ptr_eq(&auth, &model));
    }

    #[test]
    fn default_backends_are_registered_at_construction() {
        let mut config = test_config();
        config.default_backends.insert(
            "auth".to_string(),
            crate::config::BackendConfig { url: "http://u1:9000".to_string(), health_check: "/".to_string(), weight: 1 },
        );
        let gateway = Gateway::new(config);
        assert_eq!(gateway.registry.list("auth").len(), 1);
    }
}
