//! Service and instance identity.
//!
//! A [`Service`] is just a name; the registry keys instances by it. An
//! [`Instance`] is one addressable upstream endpoint belonging to a
//! service, tracked through a small health state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status of a registered instance.
///
/// `DISABLED` is reachable only through [`Instance::disable`] and
/// always implies `enabled == false`; the reverse also holds, see
/// `Instance::check_invariants` in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Disabled,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Disabled => "disabled",
            ServiceStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// One addressable upstream endpoint belonging to a service.
///
/// Identity is `(service, base_url, generation)`: the generation id is
/// stamped fresh on every `register` call so a previously-unregistered
/// instance can never be confused with a newly registered one that
/// happens to reuse the same id, even though ids are not reused in
/// practice (the registry hands out monotonically increasing ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub service: String,
    pub base_url: String,
    pub health_check_path: String,
    pub weight: u32,
    pub enabled: bool,
    pub status: ServiceStatus,
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Bumped on every register so stale health-check results for a
    /// since-unregistered-and-re-registered instance are never applied.
    pub generation: u64,
}

impl Instance {
    pub fn new(
        id: u64,
        service: impl Into<String>,
        base_url: impl Into<String>,
        health_check_path: impl Into<String>,
        weight: u32,
        metadata: HashMap<String, String>,
        generation: u64,
    ) -> Self {
        Instance {
            id,
            service: service.into(),
            base_url: base_url.into(),
            health_check_path: health_check_path.into(),
            weight,
            enabled: true,
            status: ServiceStatus::Unknown,
            last_check: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            metadata,
            generation,
        }
    }

    /// Applies a health-check or manual status transition, maintaining
    /// the invariant that the success and failure counters are never
    /// both positive: a HEALTHY transition clears failures, anything
    /// else clears successes.
    pub fn apply_status(&mut self, status: ServiceStatus, now: chrono::DateTime<chrono::Utc>) {
        self.status = status;
        self.last_check = Some(now);
        match status {
            ServiceStatus::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
            }
            _ => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
            }
        }
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.status = ServiceStatus::Disabled;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.status = ServiceStatus::Unknown;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }

    pub fn is_healthy(&self) -> bool {
        self.enabled && self.status == ServiceStatus::Healthy
    }
}
