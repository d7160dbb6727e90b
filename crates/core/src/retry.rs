//! Retry loop with exponential backoff and full jitter.
//!
//! The executor owns everything that happens between the admission stages
//! and the wrapped operation: per-attempt circuit consultation, the timeout
//! guard, failure classification, backoff sleeps, and the bulkhead slot's
//! fate across those sleeps. Stage rejections produced here are final; the
//! loop never retries them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bulkhead::{Bulkhead, BulkheadSlot};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::error::{ExecError, ExecResult};
use crate::policy::Policy;
use crate::timeout::{Abandoned, TimeoutGuard};

/// Per-call context threaded through the attempt loop.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Safe-to-retry flag. Non-idempotent calls are invoked exactly once.
    pub idempotent: bool,
    /// Caller-supplied cancellation; firing abandons the call.
    pub cancel: CancellationToken,
    /// Optional overall deadline for the whole call, retries included.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self { idempotent: true, cancel: CancellationToken::new(), deadline: None }
    }
}

/// What the previous attempt left behind when the loop has to stop.
enum LastFailure<E> {
    Operation(E),
    Timeout,
}

/// Drives attempts for a single resource key.
#[derive(Debug)]
pub struct RetryExecutor {
    key: String,
    /// Attempts beyond the first, across all calls.
    retries: AtomicU64,
}

impl RetryExecutor {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), retries: AtomicU64::new(0) }
    }

    /// Total retry attempts issued so far.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Exponential backoff for `attempt` (1-based), capped at `max_delay`.
    fn backoff_delay(policy: &Policy, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        policy
            .base_delay
            .checked_mul(2u32.saturating_pow(exp))
            .map_or(policy.max_delay, |delay| delay.min(policy.max_delay))
    }

    /// Full jitter: a uniform draw from `0..=delay`.
    fn jittered(delay: Duration) -> Duration {
        let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if millis == 0 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Run the attempt loop for one admitted call.
    ///
    /// `slot` is the bulkhead slot the admission stage already holds. With
    /// `hold_slot_during_backoff` unset the slot is released before each
    /// backoff sleep and re-acquired from `bulkhead` afterwards; a failed
    /// re-acquisition surfaces as `BulkheadFull`. `classify` decides whether
    /// an operation error is worth another attempt; terminal errors and
    /// every failure of a non-idempotent call surface immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute<C, F, Fut, T, E>(
        &self,
        slot: BulkheadSlot,
        breaker: &CircuitBreaker<C>,
        bulkhead: &Bulkhead,
        guard: &TimeoutGuard,
        policy: &Policy,
        ctx: &CallContext,
        classify: impl Fn(&E) -> bool,
        mut op: F,
    ) -> ExecResult<T, E>
    where
        C: Clock,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = tokio::time::Instant::now();
        let mut slot = Some(slot);
        let mut attempt: u32 = 1;
        let mut last_failure: Option<LastFailure<E>>;

        loop {
            // The circuit is consulted before every attempt, not just the
            // first, so a breaker opened by concurrent traffic stops the
            // loop mid-flight.
            if let Err(retry_after) = breaker.try_acquire() {
                return Err(ExecError::CircuitOpen { key: self.key.clone(), retry_after });
            }

            let limit = self.attempt_limit(guard, policy, ctx, started);
            match guard.run_with_limit(limit, &ctx.cancel, op()).await {
                Ok(Ok(value)) => {
                    breaker.on_success();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    breaker.on_failure();
                    if !ctx.idempotent || !classify(&err) {
                        return Err(ExecError::Terminal { key: self.key.clone(), source: err });
                    }
                    debug!(key = %self.key, attempt, error = %err, "retryable failure");
                    last_failure = Some(LastFailure::Operation(err));
                }
                Err(Abandoned::Deadline) => {
                    // Outcome unknown; only idempotent calls may try again.
                    breaker.on_failure();
                    if !ctx.idempotent {
                        return Err(self.timeout_error(guard));
                    }
                    last_failure = Some(LastFailure::Timeout);
                }
                Err(Abandoned::Cancelled) => {
                    // Outcome unknown; count it against the breaker so an
                    // admitted half-open trial is resolved, not held forever.
                    breaker.on_failure();
                    return Err(self.timeout_error(guard));
                }
            }

            if attempt >= policy.max_attempts {
                return Err(self.surface(last_failure, guard));
            }

            let delay = Self::jittered(Self::backoff_delay(policy, attempt));
            if self.out_of_time(policy, ctx, started, delay) {
                return Err(self.surface(last_failure, guard));
            }

            if !policy.hold_slot_during_backoff {
                slot = None;
            }
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(self.timeout_error(guard)),
                () = tokio::time::sleep(delay) => {}
            }
            if slot.is_none() {
                match bulkhead.acquire().await {
                    Some(reacquired) => slot = Some(reacquired),
                    None => {
                        return Err(ExecError::BulkheadFull {
                            key: self.key.clone(),
                            capacity: bulkhead.capacity(),
                        });
                    }
                }
            }

            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Per-attempt time limit: the policy timeout clamped by the remaining
    /// overall deadline and retry budget.
    fn attempt_limit(
        &self,
        guard: &TimeoutGuard,
        policy: &Policy,
        ctx: &CallContext,
        started: tokio::time::Instant,
    ) -> Duration {
        let mut limit = guard.timeout();
        limit = limit.min(policy.retry_budget.saturating_sub(started.elapsed()));
        if let Some(deadline) = ctx.deadline {
            limit = limit.min(deadline.saturating_duration_since(tokio::time::Instant::now()));
        }
        limit
    }

    /// Would sleeping `delay` overrun the retry budget or call deadline?
    fn out_of_time(
        &self,
        policy: &Policy,
        ctx: &CallContext,
        started: tokio::time::Instant,
        delay: Duration,
    ) -> bool {
        if started.elapsed() + delay >= policy.retry_budget {
            debug!(key = %self.key, "retry budget exhausted");
            return true;
        }
        if let Some(deadline) = ctx.deadline {
            if tokio::time::Instant::now() + delay >= deadline {
                debug!(key = %self.key, "call deadline reached during backoff");
                return true;
            }
        }
        false
    }

    fn surface<E>(&self, last: Option<LastFailure<E>>, guard: &TimeoutGuard) -> ExecError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match last {
            Some(LastFailure::Operation(source)) => {
                ExecError::Terminal { key: self.key.clone(), source }
            }
            Some(LastFailure::Timeout) | None => self.timeout_error(guard),
        }
    }

    fn timeout_error<E>(&self, guard: &TimeoutGuard) -> ExecError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ExecError::Timeout { key: self.key.clone(), timeout: guard.timeout() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use thiserror::Error;

    use crate::clock::MockClock;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    fn is_transient(err: &FakeError) -> bool {
        matches!(err, FakeError::Transient)
    }

    struct Rig {
        executor: RetryExecutor,
        breaker: CircuitBreaker<MockClock>,
        bulkhead: Bulkhead,
        guard: TimeoutGuard,
        policy: Policy,
    }

    fn rig(policy: Policy) -> Rig {
        Rig {
            executor: RetryExecutor::new("svc"),
            breaker: CircuitBreaker::with_clock(
                "svc",
                Arc::new(policy.clone()),
                MockClock::new(),
            ),
            bulkhead: Bulkhead::new("svc", &policy),
            guard: TimeoutGuard::new("svc", policy.timeout_duration),
            policy,
        }
    }

    impl Rig {
        async fn run<T, F, Fut>(
            &self,
            ctx: &CallContext,
            op: F,
        ) -> ExecResult<T, FakeError>
        where
            F: FnMut() -> Fut,
            Fut: Future<Output = Result<T, FakeError>>,
        {
            let slot = self.bulkhead.acquire().await.expect("admission slot");
            self.executor
                .execute(
                    slot,
                    &self.breaker,
                    &self.bulkhead,
                    &self.guard,
                    &self.policy,
                    ctx,
                    is_transient,
                    op,
                )
                .await
        }
    }

    fn fast_policy() -> Policy {
        Policy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..Policy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_exhausts_exactly_max_attempts() {
        let rig = rig(fast_policy());
        let calls = AtomicU32::new(0);

        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Transient)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(out, Err(ExecError::Terminal { source: FakeError::Transient, .. })));
        assert_eq!(rig.executor.retry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_never_retried() {
        let rig = rig(fast_policy());
        let calls = AtomicU32::new(0);

        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Permanent)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(ExecError::Terminal { source: FakeError::Permanent, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_call_is_invoked_exactly_once() {
        let rig = rig(fast_policy());
        let calls = AtomicU32::new(0);
        let ctx = CallContext { idempotent: false, ..Default::default() };

        let out: ExecResult<(), FakeError> = rig
            .run(&ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Transient)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(ExecError::Terminal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failures() {
        let rig = rig(fast_policy());
        let calls = AtomicU32::new(0);

        let out: ExecResult<u32, FakeError> = rig
            .run(&CallContext::default(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError::Transient)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(out.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opening_mid_loop_aborts_with_circuit_open() {
        let mut policy = fast_policy();
        policy.minimum_calls = 2;
        policy.failure_rate_threshold = 50;
        policy.max_attempts = 10;
        let rig = rig(policy);
        let calls = AtomicU32::new(0);

        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Transient)
            })
            .await;

        // Two recorded failures open the circuit; the third consultation
        // rejects before invoking the operation again.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(out, Err(ExecError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_retried_for_idempotent_calls() {
        let mut policy = fast_policy();
        policy.timeout_duration = Duration::from_millis(20);
        policy.max_attempts = 2;
        let rig = rig(policy);
        let calls = AtomicU32::new(0);

        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(out, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_non_idempotent_call_is_not_retried() {
        let mut policy = fast_policy();
        policy.timeout_duration = Duration::from_millis(20);
        let rig = rig(policy);
        let calls = AtomicU32::new(0);
        let ctx = CallContext { idempotent: false, ..Default::default() };

        let out: ExecResult<(), FakeError> = rig
            .run(&ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_stops_the_loop_early() {
        let mut policy = fast_policy();
        policy.max_attempts = 100;
        policy.base_delay = Duration::from_millis(200);
        policy.max_delay = Duration::from_millis(200);
        policy.retry_budget = Duration::from_millis(300);
        let rig = rig(policy);
        let calls = AtomicU32::new(0);

        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Transient)
            })
            .await;

        assert!(calls.load(Ordering::SeqCst) < 100);
        assert!(matches!(out, Err(ExecError::Terminal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_abandons_the_call() {
        let mut policy = fast_policy();
        policy.base_delay = Duration::from_secs(1);
        policy.max_delay = Duration::from_secs(1);
        let rig = rig(policy);
        let ctx = CallContext::default();

        let cancel = ctx.cancel.clone();
        let _trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            cancel.cancel();
        });

        let out: ExecResult<(), FakeError> = rig
            .run(&ctx, || async { Err(FakeError::Transient) })
            .await;

        assert!(matches!(out, Err(ExecError::Timeout { .. })));
        // The slot released for backoff was never re-acquired.
        assert_eq!(rig.bulkhead.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_attempt_records_a_failure_on_the_breaker() {
        let rig = rig(fast_policy());
        let ctx = CallContext::default();

        let cancel = ctx.cancel.clone();
        let _trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            cancel.cancel();
        });

        let out: ExecResult<(), FakeError> = rig
            .run(&ctx, || async { std::future::pending::<Result<(), FakeError>>().await })
            .await;

        assert!(matches!(out, Err(ExecError::Timeout { .. })));
        assert_eq!(rig.breaker.metrics().window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delay_is_capped_and_jitter_stays_below_it() {
        let policy = Policy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Policy::default()
        };

        assert_eq!(RetryExecutor::backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(RetryExecutor::backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(RetryExecutor::backoff_delay(&policy, 4), Duration::from_millis(800));
        assert_eq!(RetryExecutor::backoff_delay(&policy, 5), Duration::from_secs(1));
        assert_eq!(RetryExecutor::backoff_delay(&policy, 30), Duration::from_secs(1));

        for attempt in 1..=6 {
            let cap = RetryExecutor::backoff_delay(&policy, attempt);
            for _ in 0..32 {
                assert!(RetryExecutor::jittered(cap) <= cap);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_free_while_the_loop_sleeps() {
        let mut policy = fast_policy();
        policy.max_concurrent_calls = 1;
        policy.max_attempts = 2;
        let rig = rig(policy);
        let calls = AtomicU32::new(0);

        let bulkhead = &rig.bulkhead;
        let out: ExecResult<(), FakeError> = rig
            .run(&CallContext::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    // Within an attempt the single slot is held.
                    Err(FakeError::Transient)
                }
            })
            .await;

        assert!(matches!(out, Err(ExecError::Terminal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Every exit path returns the slot.
        assert_eq!(bulkhead.in_flight(), 0);
    }
}
