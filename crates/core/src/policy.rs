//! Protection policies and the registry that owns them.
//!
//! A [`Policy`] is an immutable bundle of thresholds for one protected
//! resource: circuit breaker window, retry limits, bulkhead capacity, rate
//! limit and timeout. Policies are loaded from a TOML document with one
//! `[resources.<key>]` table per resource; any omitted field falls back to a
//! documented default. The [`PolicyRegistry`] is read-only after
//! initialization except for [`PolicyRegistry::reload`], which swaps the
//! whole map atomically so readers never observe a half-updated document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize integer milliseconds into a `Duration`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_failure_rate_threshold() -> u8 {
    50
}
fn default_sliding_window_size() -> usize {
    100
}
fn default_minimum_calls() -> u64 {
    10
}
fn default_wait_duration_open() -> Duration {
    Duration::from_secs(30)
}
fn default_permitted_calls_half_open() -> u32 {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}
fn default_retry_budget() -> Duration {
    Duration::from_secs(30)
}
fn default_max_concurrent_calls() -> usize {
    10
}
fn default_max_queue_wait() -> Duration {
    Duration::ZERO
}
fn default_rate_limit_capacity() -> u64 {
    100
}
fn default_refill_per_second() -> f64 {
    50.0
}
fn default_timeout_duration() -> Duration {
    Duration::from_secs(5)
}

/// Immutable protection configuration for one resource key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Failure percentage at which the circuit opens (1-100).
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: u8,
    /// Count-based sliding window of recorded call outcomes.
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,
    /// Samples required before the failure rate is evaluated at all.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u64,
    /// Cooldown before an open circuit admits trial calls again.
    #[serde(default = "default_wait_duration_open", with = "duration_millis")]
    pub wait_duration_open: Duration,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_permitted_calls_half_open")]
    pub permitted_calls_half_open: u32,

    /// Total invocations allowed per logical call (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt up to `max_delay`.
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,
    /// Overall deadline for the whole retry loop.
    #[serde(default = "default_retry_budget", with = "duration_millis")]
    pub retry_budget: Duration,
    /// Keep the bulkhead slot while sleeping between attempts. When false
    /// the slot is released before the backoff sleep and re-acquired after.
    #[serde(default)]
    pub hold_slot_during_backoff: bool,

    /// Concurrency cap for the resource.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// How long a caller may queue for a bulkhead slot; zero rejects
    /// immediately.
    #[serde(default = "default_max_queue_wait", with = "duration_millis")]
    pub max_queue_wait: Duration,

    /// Token bucket capacity (burst size).
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u64,
    /// Token refill rate in tokens per second.
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,

    /// Hard deadline for a single attempt.
    #[serde(default = "default_timeout_duration", with = "duration_millis")]
    pub timeout_duration: Duration,

    /// Critical dependency: an open circuit here escalates degradation to
    /// EMERGENCY, and calls against it are exempt from emergency shedding.
    #[serde(default)]
    pub critical: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            sliding_window_size: default_sliding_window_size(),
            minimum_calls: default_minimum_calls(),
            wait_duration_open: default_wait_duration_open(),
            permitted_calls_half_open: default_permitted_calls_half_open(),
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            retry_budget: default_retry_budget(),
            hold_slot_during_backoff: false,
            max_concurrent_calls: default_max_concurrent_calls(),
            max_queue_wait: default_max_queue_wait(),
            rate_limit_capacity: default_rate_limit_capacity(),
            refill_per_second: default_refill_per_second(),
            timeout_duration: default_timeout_duration(),
            critical: false,
        }
    }
}

impl Policy {
    /// Check the policy invariants; `key` names the offending resource in
    /// the error message.
    pub fn validate(&self, key: &str) -> ConfigResult<()> {
        let invalid = |message: &str| ConfigError::InvalidPolicy {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.failure_rate_threshold == 0 || self.failure_rate_threshold > 100 {
            return Err(invalid("failure_rate_threshold must be within 1..=100"));
        }
        if self.sliding_window_size == 0 {
            return Err(invalid("sliding_window_size must be greater than 0"));
        }
        if self.minimum_calls == 0 {
            return Err(invalid("minimum_calls must be greater than 0"));
        }
        if self.wait_duration_open.is_zero() {
            return Err(invalid("wait_duration_open must be greater than 0"));
        }
        if self.permitted_calls_half_open == 0 {
            return Err(invalid("permitted_calls_half_open must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(invalid("base_delay must be greater than 0"));
        }
        if self.max_delay < self.base_delay {
            return Err(invalid("max_delay must be at least base_delay"));
        }
        if self.retry_budget.is_zero() {
            return Err(invalid("retry_budget must be greater than 0"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(invalid("max_concurrent_calls must be greater than 0"));
        }
        if self.rate_limit_capacity == 0 {
            return Err(invalid("rate_limit_capacity must be greater than 0"));
        }
        if self.refill_per_second.is_nan() || self.refill_per_second <= 0.0 {
            return Err(invalid("refill_per_second must be greater than 0"));
        }
        if self.timeout_duration.is_zero() {
            return Err(invalid("timeout_duration must be greater than 0"));
        }
        Ok(())
    }
}

/// On-disk shape of the policy document.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    /// Fallback policy for keys without an explicit entry.
    #[serde(default)]
    default: Option<Policy>,
    /// One table per protected resource key.
    #[serde(default)]
    resources: HashMap<String, Policy>,
}

#[derive(Debug)]
struct Snapshot {
    default: Arc<Policy>,
    resources: HashMap<String, Arc<Policy>>,
}

/// Named, immutable policies for every protected resource.
///
/// Lookups return an `Arc<Policy>` clone, so an in-flight call keeps the
/// policy it started with even across a concurrent [`reload`].
///
/// [`reload`]: PolicyRegistry::reload
#[derive(Debug)]
pub struct PolicyRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl PolicyRegistry {
    /// Registry where every key resolves to the built-in defaults.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                default: Arc::new(Policy::default()),
                resources: HashMap::new(),
            })),
        }
    }

    /// Parse and validate a TOML policy document.
    pub fn from_toml(document: &str) -> ConfigResult<Self> {
        let registry = Self::new();
        registry.reload(document)?;
        Ok(registry)
    }

    /// Build a registry from explicit per-key policies (tests, embedding).
    pub fn with_policies<I>(policies: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (String, Policy)>,
    {
        let mut resources = HashMap::new();
        for (key, policy) in policies {
            policy.validate(&key)?;
            resources.insert(key, Arc::new(policy));
        }
        let registry = Self::new();
        *registry.snapshot.write() =
            Arc::new(Snapshot { default: Arc::new(Policy::default()), resources });
        Ok(registry)
    }

    /// Policy for `key`, falling back to the document's `[default]` table or
    /// the built-in defaults.
    pub fn get(&self, key: &str) -> Arc<Policy> {
        let snapshot = self.snapshot.read();
        snapshot.resources.get(key).unwrap_or(&snapshot.default).clone()
    }

    /// Configured resource keys.
    pub fn keys(&self) -> Vec<String> {
        self.snapshot.read().resources.keys().cloned().collect()
    }

    /// Replace every policy from a new TOML document.
    ///
    /// The swap happens only after the entire document parses and validates;
    /// on error the previous snapshot stays in place untouched.
    pub fn reload(&self, document: &str) -> ConfigResult<()> {
        let parsed: PolicyDocument = toml::from_str(document)?;

        let default = parsed.default.unwrap_or_default();
        default.validate("default")?;

        let mut resources = HashMap::with_capacity(parsed.resources.len());
        for (key, policy) in parsed.resources {
            policy.validate(&key)?;
            resources.insert(key, Arc::new(policy));
        }

        let next = Arc::new(Snapshot { default: Arc::new(default), resources });
        let count = next.resources.len();
        *self.snapshot.write() = next;
        info!(resources = count, "policy registry reloaded");
        Ok(())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
