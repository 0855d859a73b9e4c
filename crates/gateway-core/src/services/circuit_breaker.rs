//! Per-service circuit breaker state machine.
//!
//! Grounded on the teacher's own
//! `crates/gateway-core/src/services/circuit_breaker.rs`: the
//! atomics-plus-async-`RwLock` shape, the `call<F, T, E>` wrapping
//! primitive and the `CircuitBreakerError` sentinel are kept almost
//! verbatim. Two additions close the gap with the specification: the
//! defaults now match `success_threshold = 2`, `open_timeout = 60s`
//! (the teacher had 3 and 30s), and half-open calls are now bounded by
//! `half_open_max_calls` via an in-flight counter, which the teacher
//! never limited.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use tokio::sync::RwLock;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through.
    Closed = 0,
    /// Circuit is open - failing fast.
    Open = 1,
    /// Testing if the upstream has recovered.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Tunable thresholds for one circuit breaker cell.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub open_timeout: Duration,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// One per-service circuit breaker cell.
///
/// Atomic counters carry the performance-critical path; the async
/// `RwLock` guards only the last-failure timestamp, which is read on
/// every call but written only on failure and on the open->half-open
/// transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    half_open_in_flight: AtomicU64,
    last_failure_time: RwLock<Option<Instant>>,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            half_open_in_flight: AtomicU64::new(0),
            last_failure_time: RwLock::new(None),
            name,
        })
    }

    /// Executes `operation` under breaker protection. Rejects with
    /// [`CircuitBreakerError::CircuitOpen`] without ever polling
    /// `operation` if the breaker is open, or half-open with no spare
    /// call slot. `Ok` counts as success, `Err` as failure.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |result| {
            if result.is_ok() { Outcome::Success } else { Outcome::Failure }
        })
        .await
    }

    /// Like [`CircuitBreaker::call`], but lets the caller classify the
    /// result beyond the binary ok/err split. Upstream 4xx responses,
    /// for instance, are client errors rather than upstream faults: the
    /// pipeline passes a `classify` that returns [`Outcome::Neutral`]
    /// for them so they move neither the failure nor the success
    /// counter.
    pub async fn call_classified<F, T, E>(
        &self,
        operation: F,
        classify: impl FnOnce(&Result<T, E>) -> Outcome,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        let half_open_slot = match self.try_enter().await {
            Entry::Rejected => {
                debug!("circuit breaker {} is open, failing fast", self.name);
                return Err(CircuitBreakerError::CircuitOpen);
            }
            Entry::Admitted { half_open_slot } => half_open_slot,
        };

        let result = operation.await;

        if half_open_slot {
            self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        match classify(&result) {
            Outcome::Success => self.on_success().await,
            Outcome::Failure => self.on_failure().await,
            Outcome::Neutral => {}
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    async fn try_enter(&self) -> Entry {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));
        match state {
            CircuitState::Closed => Entry::Admitted { half_open_slot: false },
            CircuitState::Open => {
                let should_reset = match *self.last_failure_time.read().await {
                    Some(last_failure) => last_failure.elapsed() >= self.config.open_timeout,
                    None => false,
                };
                if should_reset {
                    self.transition_to_half_open().await;
                    // First attempt after reset takes a half-open slot.
                    self.half_open_in_flight.store(1, Ordering::Release);
                    Entry::Admitted { half_open_slot: true }
                } else {
                    Entry::Rejected
                }
            }
            CircuitState::HalfOpen => {
                let mut current = self.half_open_in_flight.load(Ordering::Acquire);
                loop {
                    if current >= self.config.half_open_max_calls {
                        return Entry::Rejected;
                    }
                    match self.half_open_in_flight.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Entry::Admitted { half_open_slot: true },
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }

    async fn on_success(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));
        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {
                debug!("unexpected success while circuit {} is open", self.name);
            }
        }
    }

    async fn on_failure(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));
        match state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open().await;
            }
            CircuitState::Open => {
                *self.last_failure_time.write().await = Some(Instant::now());
            }
        }
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.last_failure_time.write().await = Some(Instant::now());
        self.success_count.store(0, Ordering::Release);
        self.half_open_in_flight.store(0, Ordering::Release);
        warn!("circuit breaker {} opened", self.name);
    }

    async fn transition_to_half_open(&self) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        info!("circuit breaker {} transitioned to half-open", self.name);
    }

    async fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_in_flight.store(0, Ordering::Release);
        info!("circuit breaker {} closed, upstream recovered", self.name);
    }

    /// Resets to CLOSED unconditionally, clearing all counters.
    pub async fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_in_flight.store(0, Ordering::Release);
        *self.last_failure_time.write().await = None;
    }

    pub fn get_state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn get_failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn get_success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }
}

enum Entry {
    Admitted { half_open_slot: bool },
    Rejected,
}

/// How a completed operation should be scored against the breaker's
/// counters. See [`CircuitBreaker::call_classified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Errors produced by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("operation failed: {0}")]
    OperationFailed(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_reach_threshold() {
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_polling_operation() {
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let mut polled = false;
        let result = breaker
            .call(async {
                polled = true;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
        assert!(!polled);
    }

    #[tokio::test]
    async fn half_open_after_timeout_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);
        let _ = breaker.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(breaker.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker.call(async { Err::<(), &str>("boom") }).await;
        assert_eq!(breaker.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn entering_half_open_clears_the_failure_streak_that_opened_it() {
        // Exactly one of failure_count/success_count must be nonzero
        // immediately after any state-mutating call. A stale
        // failure_count carried into HALF_OPEN would violate that the
        // moment a success bumps success_count above zero.
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.get_failure_count(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);
        assert_eq!(breaker.get_failure_count(), 0);
        assert_eq!(breaker.get_success_count(), 1);
    }

    #[tokio::test]
    async fn neutral_outcome_moves_neither_counter() {
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker
            .call_classified(async { Ok::<_, &str>(404) }, |_| Outcome::Neutral)
            .await;
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        assert_eq!(breaker.get_failure_count(), 0);
        assert_eq!(breaker.get_success_count(), 0);
    }

    #[tokio::test]
    async fn excess_half_open_calls_are_rejected_as_if_open() {
        // half_open_max_calls = 1: first slot is consumed by the
        // reset-triggering call itself before it resolves.
        let breaker = CircuitBreaker::new("svc".into(), config());
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        let _ = breaker.call(async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (first, second) = tokio::join!(
            breaker.call(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, &str>(())
            }),
            breaker.call(async { Ok::<_, &str>(()) })
        );
        let open_count = [&first, &second]
            .into_iter()
            .filter(|r| matches!(r, Err(CircuitBreakerError::CircuitOpen)))
            .count();
        assert_eq!(open_count, 1);
    }
}
