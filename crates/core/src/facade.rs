//! Execution facade composing the full protection pipeline.
//!
//! One facade instance serves the whole process. Per-resource components
//! (breaker, bulkhead, limiter, timeout guard, retry executor) live in a
//! lazily populated arena keyed by resource name; the pipeline for every
//! call is fixed: degradation shed check, bulkhead admission, rate limiter
//! admission, then the retry loop with its per-attempt circuit consultation
//! and timeout guard. A stage rejection short-circuits with that stage's
//! error and is never retried here.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::bulkhead::{Bulkhead, BulkheadMetrics};
use crate::circuit_breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::degradation::{
    CircuitHealth, CircuitHealthSource, DegradationConfig, DegradationLevel, DegradationManager,
    MetricSource, NullMetricSource,
};
use crate::error::{ConfigResult, ExecError, ExecResult};
use crate::histogram::Histogram;
use crate::policy::{Policy, PolicyRegistry};
use crate::rate_limiter::{RateLimiter, RateLimiterMetrics};
use crate::retry::{CallContext, RetryExecutor};
use crate::timeout::TimeoutGuard;

/// Per-call options supplied by the embedding service.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Declares the operation safe to invoke more than once. Defaults to
    /// false; only idempotent calls are ever retried.
    pub idempotent: bool,
    /// Treat this call as critical: exempt from emergency shedding.
    /// The policy's `critical` flag sets this for every call on the key.
    pub critical: bool,
    /// Overall deadline for the call, retries and backoff included.
    pub deadline: Option<tokio::time::Instant>,
    /// Cancellation handle; firing abandons the call.
    pub cancel: CancellationToken,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            idempotent: false,
            critical: false,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl CallOptions {
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Everything the pipeline needs for one resource key.
struct ResourceState<C: Clock> {
    policy: Arc<Policy>,
    breaker: CircuitBreaker<C>,
    bulkhead: Bulkhead,
    limiter: RateLimiter<C>,
    guard: TimeoutGuard,
    executor: RetryExecutor,
    calls: AtomicU64,
}

impl<C: Clock + Clone> ResourceState<C> {
    fn new(key: &str, policy: Arc<Policy>, clock: C) -> Self {
        Self {
            breaker: CircuitBreaker::with_clock(key, Arc::clone(&policy), clock.clone()),
            bulkhead: Bulkhead::new(key, &policy),
            limiter: RateLimiter::with_clock(key, &policy, clock),
            guard: TimeoutGuard::new(key, policy.timeout_duration),
            executor: RetryExecutor::new(key),
            calls: AtomicU64::new(0),
            policy,
        }
    }
}

/// Read-only metrics for one resource key.
#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    pub key: String,
    pub calls: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub circuit: CircuitMetrics,
    pub bulkhead: BulkheadMetrics,
    pub rate_limiter: RateLimiterMetrics,
}

/// Read-only snapshot across the whole facade.
#[derive(Debug, Clone)]
pub struct FacadeMetrics {
    pub degradation_level: DegradationLevel,
    pub shed_calls: u64,
    pub resources: Vec<ResourceMetrics>,
}

/// Samples circuit health straight off the arena for the degradation
/// manager.
struct ArenaHealth<C: Clock> {
    arena: Arc<DashMap<String, Arc<ResourceState<C>>>>,
}

impl<C: Clock> CircuitHealthSource for ArenaHealth<C> {
    fn circuit_health(&self) -> CircuitHealth {
        let mut health = CircuitHealth::default();
        for entry in self.arena.iter() {
            if entry.breaker.state() == CircuitState::Open {
                health.open += 1;
                if entry.policy.critical {
                    health.critical_open = true;
                }
            }
        }
        health
    }
}

/// Process-wide entry point wrapping calls to unreliable dependencies.
pub struct ExecutionFacade<C: Clock + Clone = SystemClock> {
    registry: PolicyRegistry,
    arena: Arc<DashMap<String, Arc<ResourceState<C>>>>,
    histogram: Histogram,
    degradation: Arc<DegradationManager>,
    shed_calls: AtomicU64,
    shutdown: CancellationToken,
    clock: C,
}

impl ExecutionFacade<SystemClock> {
    /// Facade on the system clock with default degradation thresholds and
    /// no host metrics.
    pub fn new(registry: PolicyRegistry) -> Self {
        Self::with_parts(
            registry,
            DegradationConfig::default(),
            Arc::new(NullMetricSource),
            SystemClock,
        )
    }

    /// Facade with explicit degradation configuration and a host metric
    /// source.
    pub fn with_degradation(
        registry: PolicyRegistry,
        config: DegradationConfig,
        metrics: Arc<dyn MetricSource>,
    ) -> Self {
        Self::with_parts(registry, config, metrics, SystemClock)
    }
}

impl<C: Clock + Clone> ExecutionFacade<C> {
    /// Fully explicit constructor; tests inject a mock clock here.
    ///
    /// When called inside a tokio runtime this also spawns the periodic
    /// degradation evaluation; outside a runtime the caller must drive
    /// [`evaluate_degradation_now`](Self::evaluate_degradation_now).
    pub fn with_parts(
        registry: PolicyRegistry,
        config: DegradationConfig,
        metrics: Arc<dyn MetricSource>,
        clock: C,
    ) -> Self {
        let histogram = Histogram::new();
        let degradation =
            Arc::new(DegradationManager::new(config, histogram.clone(), metrics));
        let arena = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        if tokio::runtime::Handle::try_current().is_ok() {
            let health = Arc::new(ArenaHealth { arena: Arc::clone(&arena) });
            let _ticker = degradation.spawn_ticker(health, shutdown.clone());
        } else {
            debug!("no tokio runtime at construction, degradation ticker not started");
        }

        Self {
            registry,
            arena,
            histogram,
            degradation,
            shed_calls: AtomicU64::new(0),
            shutdown,
            clock,
        }
    }

    /// Execute `op` against `key` under the key's protection policy.
    ///
    /// `classify` decides whether an operation error is transient (worth a
    /// retry) or terminal. Stage rejections surface as their own
    /// [`ExecError`] variants and never invoke `op`.
    #[instrument(level = "debug", skip(self, options, classify, op))]
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        options: CallOptions,
        classify: impl Fn(&E) -> bool,
        op: F,
    ) -> ExecResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let state = self.state_for(key);
        let critical = options.critical || state.policy.critical;

        if self.degradation.should_shed(critical) {
            self.shed_calls.fetch_add(1, Ordering::Relaxed);
            let level = self.degradation.current_level();
            debug!(key, %level, "call shed");
            return Err(ExecError::Overloaded { level });
        }

        state.calls.fetch_add(1, Ordering::Relaxed);
        let started = std::time::Instant::now();

        let slot = match state.bulkhead.acquire().await {
            Some(slot) => slot,
            None => {
                return Err(ExecError::BulkheadFull {
                    key: key.to_string(),
                    capacity: state.bulkhead.capacity(),
                });
            }
        };

        if let Err(retry_after) = state.limiter.try_acquire() {
            return Err(ExecError::RateLimited { key: key.to_string(), retry_after });
        }

        let ctx = CallContext {
            idempotent: options.idempotent,
            cancel: options.cancel.clone(),
            deadline: options.deadline,
        };
        let outcome = state
            .executor
            .execute(
                slot,
                &state.breaker,
                &state.bulkhead,
                &state.guard,
                &state.policy,
                &ctx,
                classify,
                op,
            )
            .await;

        // Stage rejections never reached the operation; everything else is
        // a real call whose latency feeds the degradation signal.
        let record = match &outcome {
            Ok(_) => true,
            Err(err) => !err.is_stage_rejection(),
        };
        if record {
            self.histogram.record(started.elapsed());
        }
        outcome
    }

    /// Like [`execute`](Self::execute), but on classified failure hands the
    /// error to `fallback` instead of returning it directly. The fallback
    /// always receives the classified error; the facade never swallows one.
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        key: &str,
        options: CallOptions,
        classify: impl Fn(&E) -> bool,
        op: F,
        fallback: FB,
    ) -> ExecResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(ExecError<E>) -> FbFut,
        FbFut: Future<Output = ExecResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.execute(key, options, classify, op).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(key, error = %err, "invoking fallback");
                fallback(err).await
            }
        }
    }

    /// Current process-wide degradation level; lock-free.
    pub fn degradation_level(&self) -> DegradationLevel {
        self.degradation.current_level()
    }

    /// Run one degradation evaluation immediately (tests, manual ticks).
    pub fn evaluate_degradation_now(&self) -> DegradationLevel {
        let health = ArenaHealth { arena: Arc::clone(&self.arena) };
        self.degradation.evaluate_now(&health)
    }

    /// Replace all policies from a new TOML document.
    ///
    /// The registry swap is atomic; per-key state is rebuilt on next use
    /// only for keys whose policy actually changed, so an unchanged key
    /// keeps its circuit history across reloads.
    pub fn reload(&self, document: &str) -> ConfigResult<()> {
        self.registry.reload(document)?;
        self.arena.retain(|key, state| *self.registry.get(key) == *state.policy);
        Ok(())
    }

    /// Drop the cached components for `key`; the next call rebuilds them
    /// from the registry.
    pub fn evict(&self, key: &str) {
        self.arena.remove(key);
    }

    /// Read-only metrics snapshot for an external collector.
    pub fn metrics(&self) -> FacadeMetrics {
        let resources = self
            .arena
            .iter()
            .map(|entry| ResourceMetrics {
                key: entry.key().clone(),
                calls: entry.calls.load(Ordering::Relaxed),
                retries: entry.executor.retry_count(),
                timeouts: entry.guard.timeout_count(),
                circuit: entry.breaker.metrics(),
                bulkhead: entry.bulkhead.metrics(),
                rate_limiter: entry.limiter.metrics(),
            })
            .collect();
        FacadeMetrics {
            degradation_level: self.degradation.current_level(),
            shed_calls: self.shed_calls.load(Ordering::Relaxed),
            resources,
        }
    }

    /// Stop the background degradation task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn state_for(&self, key: &str) -> Arc<ResourceState<C>> {
        if let Some(state) = self.arena.get(key) {
            return Arc::clone(&state);
        }
        let policy = self.registry.get(key);
        Arc::clone(
            &self
                .arena
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(ResourceState::new(key, policy, self.clock.clone()))
                }),
        )
    }
}

impl<C: Clock + Clone> Drop for ExecutionFacade<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<C: Clock + Clone> std::fmt::Debug for ExecutionFacade<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionFacade")
            .field("resources", &self.arena.len())
            .field("degradation_level", &self.degradation.current_level())
            .finish()
    }
}
