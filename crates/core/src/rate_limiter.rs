//! Keyed token-bucket rate limiting.
//!
//! One limiter serves a resource key and lazily tracks token buckets per
//! sub-key (caller identity, tenant, ...). Buckets refill continuously at
//! `refill_per_second` up to `rate_limit_capacity`; refill and consume are
//! atomic per bucket under its map shard lock. Idle buckets are evicted by
//! an opportunistic sweep, and a hard cap on tracked sub-keys stops
//! attacker-controlled cardinality from growing the map without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::policy::Policy;

/// Sub-key used by callers that do not partition their traffic.
const DEFAULT_BUCKET: &str = "";

/// Buckets idle this long are dropped by the sweep.
const IDLE_TTL: Duration = Duration::from_secs(300);

/// New sub-keys are rejected once this many buckets are tracked.
const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Snapshot of one limiter for the metrics surface.
#[derive(Debug, Clone)]
pub struct RateLimiterMetrics {
    pub capacity: u64,
    pub refill_per_second: f64,
    pub tracked_keys: usize,
    pub admitted: u64,
    pub rejected: u64,
}

/// Token-bucket admission control for a single resource key.
#[derive(Debug)]
pub struct RateLimiter<C: Clock = SystemClock> {
    key: String,
    capacity: u64,
    refill_per_second: f64,
    buckets: DashMap<String, Bucket>,
    last_sweep: Mutex<Instant>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    clock: C,
}

impl RateLimiter<SystemClock> {
    /// Limiter on the system clock.
    pub fn new(key: impl Into<String>, policy: &Policy) -> Self {
        Self::with_clock(key, policy, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Limiter with an injected clock (tests).
    pub fn with_clock(key: impl Into<String>, policy: &Policy, clock: C) -> Self {
        let now = clock.now();
        Self {
            key: key.into(),
            capacity: policy.rate_limit_capacity,
            refill_per_second: policy.refill_per_second,
            buckets: DashMap::new(),
            last_sweep: Mutex::new(now),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            clock,
        }
    }

    /// Admit one call on the default bucket.
    ///
    /// `Err(retry_after)` estimates when one token will be available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_keyed(DEFAULT_BUCKET)
    }

    /// Admit one call on the bucket for `sub_key`.
    pub fn try_acquire_keyed(&self, sub_key: &str) -> Result<(), Duration> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        if !self.buckets.contains_key(sub_key) && self.buckets.len() >= MAX_TRACKED_KEYS {
            // Map is saturated; refuse new sub-keys rather than grow.
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, tracked = self.buckets.len(), "rate limiter key cap hit");
            return Err(self.time_per_token());
        }

        let mut bucket = self.buckets.entry(sub_key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity as f64,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity as f64);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.admitted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            let deficit = (1.0 - bucket.tokens).max(0.0);
            let retry_after = Duration::from_secs_f64(deficit / self.refill_per_second);
            drop(bucket);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, sub_key, retry_after = ?retry_after, "rate limited");
            Err(retry_after)
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
            tracked_keys: self.buckets.len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn time_per_token(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refill_per_second)
    }

    /// Drop buckets idle past [`IDLE_TTL`]. Runs at most once per TTL so the
    /// hot path almost never pays for it.
    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if now.saturating_duration_since(*last_sweep) < IDLE_TTL {
                return;
            }
            *last_sweep = now;
        }
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < IDLE_TTL);
        // Concurrent inserts during the retain can outpace the evictions.
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(key = %self.key, evicted, "evicted idle rate limit buckets");
        }
    }
}
