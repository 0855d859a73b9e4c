//! Periodic health-check sweep feeding the registry.
//!
//! Grounded on `gateway/monitoring/health_check.py` for the tick/timeout
//! shape and on the teacher's `kairos-gateway/src/main.rs` for how a
//! background tokio task is spawned and held onto by the aggregate
//! that owns it (no `asyncio.create_task`-style fire-and-forget).

use crate::registry::Registry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// A singleton scheduled worker, one per gateway instance, tied to
/// startup/shutdown via the returned [`tokio::task::JoinHandle`].
pub struct HealthChecker {
    registry: Arc<Registry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("health-check client must build with static config");
        HealthChecker { registry, client, interval, timeout }
    }

    /// Spawns the periodic tick loop. The handle is owned by the
    /// caller (the `Gateway` aggregate); dropping/aborting it is the
    /// lifecycle hook for shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.run_tick().await;
            }
        })
    }

    /// One pass over every enabled instance, parallel fan-out, merged
    /// back into the registry. Public so tests and an on-demand
    /// `/health` recheck (if ever added) can drive a single tick
    /// without waiting on the timer.
    pub async fn run_tick(&self) {
        let instances = self.registry.snapshot_enabled();
        let checks = instances.iter().map(|instance| self.check_one(instance));
        let results = join_all(checks).await;

        for (instance, healthy) in instances.iter().zip(results) {
            // Tie-break: if the instance was disabled or unregistered
            // while this check was in flight, the still-enabled set no
            // longer contains it and the stale result is discarded.
            let still_enabled = self
                .registry
                .list(&instance.service)
                .iter()
                .any(|i| i.id == instance.id);
            if !still_enabled {
                continue;
            }
            let status = if healthy {
                crate::models::instance::ServiceStatus::Healthy
            } else {
                crate::models::instance::ServiceStatus::Unhealthy
            };
            self.registry.update_status(&instance.service, instance.id, status);
        }
    }

    async fn check_one(&self, instance: &crate::models::instance::Instance) -> bool {
        let base = instance.base_url.trim_end_matches('/');
        let path = instance.health_check_path.trim_start_matches('/');
        let url = format!("{base}/{path}");
        match tokio::time::timeout(self.timeout, self.client.get(&url).send()).await {
            // 2xx-4xx counts as alive; 5xx, timeouts and connection
            // errors mark the instance unhealthy.
            Ok(Ok(response)) => response.status().as_u16() < 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn tick_marks_unreachable_instance_unhealthy() {
        let registry = Arc::new(Registry::new());
        let id = registry.register("auth", "http://127.0.0.1:1", "/", 1, HashMap::new());
        let checker = HealthChecker::new(registry.clone(), Duration::from_secs(30), Duration::from_millis(200));
        checker.run_tick().await;
        let instances = registry.list("auth");
        assert_eq!(instances[0].id, id);
        assert_eq!(instances[0].status, crate::models::instance::ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn tick_skips_instances_disabled_before_the_check_runs() {
        let registry = Arc::new(Registry::new());
        let id = registry.register("auth", "http://127.0.0.1:1", "/", 1, HashMap::new());
        registry.disable("auth", id);
        let checker = HealthChecker::new(registry.clone(), Duration::from_secs(30), Duration::from_millis(200));
        checker.run_tick().await;
        // still disabled, never touched by the tick's snapshot
        assert_eq!(registry.list("auth").len(), 0);
    }
}
