//! Request-rate throttling, keyed by client identity.
//!
//! Grounded on the teacher's `middleware::rate_limit` for the in-memory
//! entry/store shape and periodic-cleanup idiom, simplified to the single
//! identity-keyed contract `gateway/core/rate_limiter.py::RateLimiter`
//! actually exposes: `is_allowed(identifier) -> bool`, no per-route or
//! per-user composite dimensions (that concept belongs to a gateway this
//! one isn't). Adds the leaky bucket algorithm, present in
//! `rate_limiter.py` but missing from the teacher. Bucket creation uses
//! an explicit check-then-lock-then-check sequence instead of the
//! teacher's single write-locked `entry().or_insert_with()`, per the
//! redesign note: a read lock covers the overwhelmingly common case of
//! an already-registered identity, and only a first-seen identity pays
//! for the write lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token_bucket" | "token-bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" | "leaky-bucket" => Ok(Algorithm::LeakyBucket),
            "fixed_window" | "fixed-window" => Ok(Algorithm::FixedWindow),
            "sliding_window" | "sliding-window" => Ok(Algorithm::SlidingWindow),
            other => Err(format!("unknown rate limit algorithm '{other}'")),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    // token/leaky bucket
    level: f64,
    last_update: Instant,
    // fixed window
    window_start: Instant,
    window_count: u64,
    // sliding window
    request_times: Vec<Instant>,
}

impl Bucket {
    fn new(now: Instant, initial_tokens: f64) -> Self {
        Bucket {
            level: initial_tokens,
            last_update: now,
            window_start: now,
            window_count: 0,
            request_times: Vec::new(),
        }
    }
}

/// Per-identity rate limiter for one configured algorithm.
///
/// A single instance covers one limiting rule (requests-per-minute plus
/// burst size); the `Gateway` aggregate owns one of these, not a global.
pub struct RateLimiter {
    algorithm: Algorithm,
    requests_per_minute: u64,
    burst_size: u64,
    window: Duration,
    buckets: RwLock<HashMap<String, Bucket>>,
    last_cleanup: RwLock<Instant>,
}

/// Cleanup is inline, not a spawned task, matching the teacher's
/// `rate_limit.rs`: it runs on the admission hot path but only every
/// `CLEANUP_INTERVAL`, so the overwhelmingly common call pays just the
/// timestamp comparison.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

impl RateLimiter {
    pub fn new(algorithm: Algorithm, requests_per_minute: u64, burst_size: u64) -> Self {
        RateLimiter {
            algorithm,
            requests_per_minute,
            burst_size,
            window: Duration::from_secs(60),
            buckets: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Whether `identity` (typically a client IP) may make one more
    /// request right now. Fails open: a poisoned lock is treated as
    /// "allow", since a throttling bug should never itself become an
    /// outage.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_n(identity, 1)
    }

    /// Full contract per base spec §4.1: `allow(identity, tokens) ->
    /// bool`, admitting only if `tokens` worth of capacity is
    /// available right now. Capacity is per-algorithm, never a combined
    /// `rpm + burst` figure: `burst_size` for token/leaky bucket,
    /// `requests_per_minute` for fixed/sliding window.
    pub fn allow_n(&self, identity: &str, tokens: u64) -> bool {
        let now = Instant::now();
        self.cleanup_if_due(now);

        // Read-only fast path for an identity already tracked.
        {
            let buckets = match self.buckets.read() {
                Ok(guard) => guard,
                Err(_) => return true,
            };
            if buckets.contains_key(identity) {
                drop(buckets);
                return self.check(identity, now, tokens);
            }
        }

        // First sight of this identity: take the write lock and
        // re-check, since another thread may have inserted it between
        // the read above and here. Token buckets start pre-filled to
        // `burst_size` (the spec's initial-burst allowance); every
        // other algorithm starts from an empty bucket.
        {
            let mut buckets = match self.buckets.write() {
                Ok(guard) => guard,
                Err(_) => return true,
            };
            let initial_level = match self.algorithm {
                Algorithm::TokenBucket => self.burst_size as f64,
                Algorithm::LeakyBucket | Algorithm::FixedWindow | Algorithm::SlidingWindow => 0.0,
            };
            buckets.entry(identity.to_string()).or_insert_with(|| Bucket::new(now, initial_level));
        }

        self.check(identity, now, tokens)
    }

    fn check(&self, identity: &str, now: Instant, tokens: u64) -> bool {
        let mut buckets = match self.buckets.write() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        let Some(bucket) = buckets.get_mut(identity) else { return true };

        match self.algorithm {
            Algorithm::TokenBucket => self.check_token_bucket(bucket, now, self.burst_size as f64, tokens),
            Algorithm::LeakyBucket => self.check_leaky_bucket(bucket, now, self.burst_size as f64, tokens),
            Algorithm::FixedWindow => self.check_fixed_window(bucket, now, self.requests_per_minute, tokens),
            Algorithm::SlidingWindow => self.check_sliding_window(bucket, now, self.requests_per_minute, tokens),
        }
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.requests_per_minute as f64 / self.window.as_secs_f64()
    }

    fn check_token_bucket(&self, bucket: &mut Bucket, now: Instant, capacity: f64, tokens: u64) -> bool {
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.level = (bucket.level + elapsed * self.refill_rate_per_sec()).min(capacity);
        bucket.last_update = now;
        let tokens = tokens as f64;
        if bucket.level >= tokens {
            bucket.level -= tokens;
            true
        } else {
            false
        }
    }

    /// Water level leaks at the configured rate; a request is allowed
    /// only if adding its unit of work keeps the level at or under
    /// capacity.
    fn check_leaky_bucket(&self, bucket: &mut Bucket, now: Instant, capacity: f64, tokens: u64) -> bool {
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        let leaked = elapsed * self.refill_rate_per_sec();
        bucket.level = (bucket.level - leaked).max(0.0);
        bucket.last_update = now;
        let tokens = tokens as f64;
        if bucket.level + tokens <= capacity {
            bucket.level += tokens;
            true
        } else {
            false
        }
    }

    fn check_fixed_window(&self, bucket: &mut Bucket, now: Instant, capacity: u64, tokens: u64) -> bool {
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.window_count = 0;
        }
        if bucket.window_count + tokens <= capacity {
            bucket.window_count += tokens;
            true
        } else {
            false
        }
    }

    fn check_sliding_window(&self, bucket: &mut Bucket, now: Instant, capacity: u64, tokens: u64) -> bool {
        let window = self.window;
        bucket.request_times.retain(|&t| now.duration_since(t) < window);
        if (bucket.request_times.len() as u64) + tokens <= capacity {
            for _ in 0..tokens {
                bucket.request_times.push(now);
            }
            true
        } else {
            false
        }
    }

    /// Drops tracked identities idle for more than twice the window, so
    /// a gateway fielding unique-IP churn doesn't grow its bucket map
    /// without bound. Public so tests can force a sweep without waiting
    /// out [`CLEANUP_INTERVAL`].
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let threshold = self.window * 2;
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < threshold);
        }
    }

    fn cleanup_if_due(&self, now: Instant) {
        {
            let last_cleanup = match self.last_cleanup.read() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if now.duration_since(*last_cleanup) < CLEANUP_INTERVAL {
                return;
            }
        }
        let mut last_cleanup = match self.last_cleanup.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if now.duration_since(*last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        *last_cleanup = now;
        drop(last_cleanup);
        self.evict_stale();
    }

    pub fn tracked_identities(&self) -> usize {
        self.buckets.read().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_allows_up_to_capacity_then_rejects() {
        // capacity is `requests_per_minute` alone; burst_size does not
        // widen a fixed/sliding window's admission ceiling.
        let limiter = RateLimiter::new(Algorithm::FixedWindow, 2, 1);
        assert!(limiter.allow("client-a"));
        assert!(limiter.allow("client-a"));
        assert!(!limiter.allow("client-a"));
    }

    #[test]
    fn sliding_window_allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(Algorithm::SlidingWindow, 2, 0);
        assert!(limiter.allow("client-b"));
        assert!(limiter.allow("client-b"));
        assert!(!limiter.allow("client-b"));
    }

    #[test]
    fn token_bucket_grants_initial_burst_then_throttles() {
        let limiter = RateLimiter::new(Algorithm::TokenBucket, 1, 1);
        assert!(limiter.allow("client-c"));
        assert!(limiter.allow("client-c"));
        assert!(!limiter.allow("client-c"));
    }

    #[test]
    fn leaky_bucket_throttles_once_capacity_is_full() {
        // capacity is `burst_size`, not rpm; a fresh queue starts empty.
        let limiter = RateLimiter::new(Algorithm::LeakyBucket, 10, 1);
        assert!(limiter.allow("client-d"));
        assert!(!limiter.allow("client-d"));
    }

    #[test]
    fn evict_stale_drops_identities_idle_past_twice_the_window() {
        let limiter = RateLimiter::new(Algorithm::FixedWindow, 10, 0);
        limiter.allow("client-stale");
        assert_eq!(limiter.tracked_identities(), 1);
        {
            let mut buckets = limiter.buckets.write().unwrap();
            let bucket = buckets.get_mut("client-stale").unwrap();
            bucket.last_update -= Duration::from_secs(121);
        }
        limiter.evict_stale();
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[test]
    fn identities_are_tracked_independently() {
        let limiter = RateLimiter::new(Algorithm::FixedWindow, 1, 0);
        assert!(limiter.allow("client-e"));
        assert!(!limiter.allow("client-e"));
        assert!(limiter.allow("client-f"));
    }

    #[test]
    fn algorithm_from_str_accepts_both_separators() {
        assert_eq!("token_bucket".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!("sliding-window".parse::<Algorithm>().unwrap(), Algorithm::SlidingWindow);
        assert!("bogus".parse::<Algorithm>().is_err());
    }

    #[test]
    fn spending_the_full_burst_in_one_call_exhausts_a_fresh_token_bucket() {
        // Base spec §8's round-trip property, literally: two consecutive
        // `allow` calls with tokens=burst against a freshly-created
        // token bucket admit the first and reject the second.
        let limiter = RateLimiter::new(Algorithm::TokenBucket, 60, 5);
        assert!(limiter.allow_n("client-g", 5));
        assert!(!limiter.allow_n("client-g", 5));
    }

    #[test]
    fn sliding_window_scenario_rejects_the_third_call_within_one_second() {
        // Base spec §8 scenario 2: sliding-window, rpm=2, three calls
        // inside one second from the same identity yield (true, true,
        // false); burst_size must not widen this, so it's left at its
        // default-ish nonzero value to prove the fix.
        let limiter = RateLimiter::new(Algorithm::SlidingWindow, 2, 10);
        assert!(limiter.allow("client-h"));
        assert!(limiter.allow("client-h"));
        assert!(!limiter.allow("client-h"));
    }
}
