//! Load balancing strategies for selecting an instance of a service.
//!
//! Grounded on the teacher's `RoundRobinBalancer`/`LeastConnectionsBalancer`/
//! `RandomBalancer`/`WeightedBalancer`/`IpHashBalancer` for the per-strategy
//! algorithms, restructured per the redesign note into a single closed
//! [`LoadBalancer`] enum with one dispatch method instead of `dyn
//! LoadBalancer` trait objects — there is a fixed, known set of
//! strategies, so the open-ended extensibility a trait buys isn't needed,
//! and an enum keeps selection monomorphic. The weighted strategy is
//! rewritten to be probability-proportional, matching
//! `gateway/core/load_balancer.py::LoadBalancer._weighted`, rather than the
//! teacher's round-robin-over-an-expanded-list approach, which drifts from
//! target proportions whenever requests arrive in bursts smaller than the
//! full weighted cycle.

use crate::models::instance::Instance;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    LeastConnections,
    Weighted,
    IpHash,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_connections" | "least-connections" => Ok(Strategy::LeastConnections),
            "weighted" => Ok(Strategy::Weighted),
            "ip_hash" | "ip-hash" => Ok(Strategy::IpHash),
            other => Err(format!("unknown load balancing strategy '{other}'")),
        }
    }
}

/// Per-service load balancer state.
///
/// One instance of this lives per service inside the `Gateway`
/// aggregate, never as a global singleton: a fresh `LoadBalancer` means
/// fresh round-robin and connection-count state, which is exactly what
/// tests and per-service isolation both want.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
    round_robin_counter: AtomicUsize,
    connections: RwLock<HashMap<u64, i64>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        LoadBalancer {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Selects one instance from `instances` (expected to already be
    /// filtered to healthy, enabled instances by the caller).
    ///
    /// For [`Strategy::LeastConnections`] this also books a connection
    /// against the chosen instance; the caller must pair every `select`
    /// that returns `Some` with exactly one later [`LoadBalancer::release`]
    /// for that instance id, regardless of how the request eventually
    /// resolves.
    pub fn select(&self, instances: &[Instance], client_ip: Option<&str>) -> Option<Instance> {
        if instances.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % instances.len();
                instances[index].clone()
            }
            Strategy::Random => {
                let index = rand::thread_rng().gen_range(0..instances.len());
                instances[index].clone()
            }
            Strategy::LeastConnections => {
                let connections = self.connections.read().unwrap();
                instances
                    .iter()
                    .min_by_key(|i| connections.get(&i.id).copied().unwrap_or(0))
                    .cloned()
                    .unwrap()
            }
            Strategy::Weighted => self.select_weighted(instances),
            Strategy::IpHash => {
                let hash = client_ip.map(Self::hash_ip).unwrap_or(0);
                instances[(hash as usize) % instances.len()].clone()
            }
        };

        if self.strategy == Strategy::LeastConnections {
            let mut connections = self.connections.write().unwrap();
            *connections.entry(chosen.id).or_insert(0) += 1;
        }

        Some(chosen)
    }

    /// Releases a connection previously booked by [`LoadBalancer::select`].
    /// A no-op for every strategy but least-connections.
    pub fn release(&self, instance_id: u64) {
        if self.strategy != Strategy::LeastConnections {
            return;
        }
        let mut connections = self.connections.write().unwrap();
        if let Some(count) = connections.get_mut(&instance_id) {
            *count -= 1;
        }
    }

    /// Like [`LoadBalancer::select`], but returns the release obligation
    /// bound to a [`ConnectionGuard`] instead of leaving it to the
    /// caller to remember. Per base spec §5's cancellation clause, a
    /// client disconnecting mid-request must still release the booked
    /// connection; a guard whose `Drop` releases handles that even when
    /// the enclosing future is dropped before an explicit `release`
    /// call would have run.
    pub fn select_guarded(
        self: &Arc<Self>,
        instances: &[Instance],
        client_ip: Option<&str>,
    ) -> Option<(Instance, ConnectionGuard)> {
        let instance = self.select(instances, client_ip)?;
        let guard = ConnectionGuard {
            load_balancer: self.clone(),
            instance_id: instance.id,
            released: AtomicBool::new(false),
        };
        Some((instance, guard))
    }

    /// Random selection with probability proportional to weight: pick a
    /// point uniformly in `[0, total_weight)` and walk the cumulative
    /// weight until it's passed. Zero-weight instances are skipped
    /// entirely unless every instance is weight 0, in which case the
    /// first instance is chosen deterministically.
    fn select_weighted(&self, instances: &[Instance]) -> Instance {
        let total: u32 = instances.iter().map(|i| i.weight).sum();
        if total == 0 {
            return instances[0].clone();
        }
        let mut point = rand::thread_rng().gen_range(0..total);
        for instance in instances {
            if instance.weight == 0 {
                continue;
            }
            if point < instance.weight {
                return instance.clone();
            }
            point -= instance.weight;
        }
        instances.last().unwrap().clone()
    }

    fn hash_ip(ip: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        hasher.finish()
    }
}

/// Holds the release obligation for one instance booked by
/// [`LoadBalancer::select_guarded`]. Releases on `Drop`, so a cancelled
/// request (client disconnects mid-call, the pipeline future is
/// dropped before it reaches an explicit release) still gives the
/// connection back exactly once. An explicit call to
/// [`ConnectionGuard::release`] is also fine — the guard tracks
/// whether it already fired so `Drop` afterwards is a no-op.
pub struct ConnectionGuard {
    load_balancer: Arc<LoadBalancer>,
    instance_id: u64,
    released: AtomicBool,
}

impl ConnectionGuard {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.load_balancer.release(self.instance_id);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn instances(n: usize) -> Vec<Instance> {
        (1..=n as u64)
            .map(|id| Instance::new(id, "svc", format!("http://u{id}:9000"), "/", 1, StdHashMap::new(), id))
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_every_instance() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let instances = instances(3);
        let selections: Vec<u64> = (0..6).map(|_| lb.select(&instances, None).unwrap().id).collect();
        assert_eq!(selections, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn select_on_empty_instances_returns_none() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        assert!(lb.select(&[], None).is_none());
    }

    #[test]
    fn ip_hash_is_stable_for_the_same_ip() {
        let lb = LoadBalancer::new(Strategy::IpHash);
        let instances = instances(5);
        let first = lb.select(&instances, Some("10.0.0.7")).unwrap().id;
        let second = lb.select(&instances, Some("10.0.0.7")).unwrap().id;
        assert_eq!(first, second);
    }

    #[test]
    fn least_connections_prefers_the_instance_with_fewest_active_calls() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let instances = instances(2);
        let first = lb.select(&instances, None).unwrap();
        // first instance now has one booked connection; next select must
        // avoid it in favor of the other, still-idle instance.
        let second = lb.select(&instances, None).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn release_allows_an_instance_to_be_reselected() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let instances = instances(2);
        let first = lb.select(&instances, None).unwrap();
        lb.release(first.id);
        let second = lb.select(&instances, None).unwrap();
        let third = lb.select(&instances, None).unwrap();
        // with the first instance released back to zero connections, one
        // of the two subsequent selects must land on it again.
        assert!(second.id == first.id || third.id == first.id);
    }

    #[test]
    fn weighted_never_selects_an_instance_outside_the_given_set() {
        let lb = LoadBalancer::new(Strategy::Weighted);
        let mut instances = instances(2);
        instances[0].weight = 9;
        instances[1].weight = 1;
        for _ in 0..50 {
            let picked = lb.select(&instances, None).unwrap();
            assert!(picked.id == 1 || picked.id == 2);
        }
    }

    #[test]
    fn weighted_with_all_zero_weights_falls_back_to_the_first_instance() {
        let lb = LoadBalancer::new(Strategy::Weighted);
        let mut instances = instances(3);
        for instance in &mut instances {
            instance.weight = 0;
        }
        for _ in 0..10 {
            assert_eq!(lb.select(&instances, None).unwrap().id, instances[0].id);
        }
    }

    #[test]
    fn weighted_skips_zero_weight_instances_when_others_have_weight() {
        let lb = LoadBalancer::new(Strategy::Weighted);
        let mut instances = instances(2);
        instances[0].weight = 0;
        instances[1].weight = 5;
        for _ in 0..20 {
            assert_eq!(lb.select(&instances, None).unwrap().id, instances[1].id);
        }
    }

    #[test]
    fn strategy_from_str_accepts_both_separators() {
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least-connections".parse::<Strategy>().unwrap(), Strategy::LeastConnections);
        assert!("bogus".parse::<Strategy>().is_err());
    }

    #[test]
    fn dropping_a_connection_guard_releases_the_booked_connection() {
        let lb = Arc::new(LoadBalancer::new(Strategy::LeastConnections));
        let instances = instances(2);
        let (first, guard) = lb.select_guarded(&instances, None).unwrap();
        let second = lb.select(&instances, None).unwrap();
        assert_ne!(first.id, second.id);

        drop(guard);
        let third = lb.select(&instances, None).unwrap();
        assert_eq!(third.id, first.id);
    }

    #[test]
    fn releasing_a_connection_guard_explicitly_makes_the_later_drop_a_no_op() {
        let lb = Arc::new(LoadBalancer::new(Strategy::LeastConnections));
        let instances = instances(1);
        let (first, guard) = lb.select_guarded(&instances, None).unwrap();
        guard.release();
        guard.release();
        drop(guard);
        let second = lb.select(&instances, None).unwrap();
        assert_eq!(second.id, first.id);
    }
}
