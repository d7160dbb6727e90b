//! Per-resource circuit breaker.
//!
//! A count-based sliding window of call outcomes drives a
//! CLOSED/OPEN/HALF_OPEN state machine. The whole state sits behind one
//! short mutex so concurrent callers always observe a consistent transition,
//! never a torn read between an outcome being recorded and the state
//! changing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::policy::Policy;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; outcomes are recorded.
    Closed,
    /// Calls are rejected without invoking the dependency.
    Open,
    /// A limited number of trial calls probe for recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of one breaker for the metrics surface.
#[derive(Debug, Clone)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    /// Outcomes currently in the sliding window.
    pub window_calls: u64,
    /// Failures among those outcomes.
    pub window_failures: u64,
    /// Failure percentage over the window, 0 when empty.
    pub failure_rate: u8,
    /// Total state transitions since creation.
    pub transitions: u64,
}

struct CircuitCore {
    state: CircuitState,
    /// Ring of recent outcomes, `true` = success. Bounded by
    /// `sliding_window_size`.
    window: VecDeque<bool>,
    window_failures: u64,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Failure-rate circuit breaker for a single resource key.
///
/// State transitions are linearizable per key; the mutex is held only for
/// bookkeeping, never across the wrapped operation.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    key: String,
    policy: Arc<Policy>,
    core: Mutex<CircuitCore>,
    transitions: AtomicU64,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    /// Breaker on the system clock.
    pub fn new(key: impl Into<String>, policy: Arc<Policy>) -> Self {
        Self::with_clock(key, policy, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Breaker with an injected clock (tests).
    pub fn with_clock(key: impl Into<String>, policy: Arc<Policy>, clock: C) -> Self {
        Self {
            key: key.into(),
            core: Mutex::new(CircuitCore {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(policy.sliding_window_size),
                window_failures: 0,
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
            transitions: AtomicU64::new(0),
            policy,
            clock,
        }
    }

    /// Ask to pass one call through.
    ///
    /// `Ok(())` admits the call (transitioning OPEN to HALF_OPEN when the
    /// cooldown has elapsed, the caller becoming the first trial).
    /// `Err(retry_after)` rejects it with the remaining cooldown as a hint;
    /// half-open callers beyond the permitted trial count are rejected with
    /// the full cooldown.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = match core.opened_at {
                    Some(at) => at,
                    None => return Err(self.policy.wait_duration_open),
                };
                let elapsed = self.clock.now().saturating_duration_since(opened_at);
                if elapsed >= self.policy.wait_duration_open {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.half_open_admitted = 1;
                    core.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(self.policy.wait_duration_open - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if core.half_open_admitted < self.policy.permitted_calls_half_open {
                    core.half_open_admitted += 1;
                    Ok(())
                } else {
                    // Beyond the permitted trials: treat as still open.
                    Err(self.policy.wait_duration_open)
                }
            }
        }
    }

    /// Record a successful call outcome.
    ///
    /// The open threshold is evaluated only in [`Self::on_failure`]: a
    /// success that brings the window to `minimum_calls` while the failure
    /// rate is already at the threshold leaves the circuit CLOSED until the
    /// next failure.
    pub fn on_success(&self) {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut core, &self.policy, true);
            }
            CircuitState::HalfOpen => {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.policy.permitted_calls_half_open {
                    // Every permitted trial succeeded: close and start a
                    // fresh window.
                    core.window.clear();
                    core.window_failures = 0;
                    core.opened_at = None;
                    self.transition(&mut core, CircuitState::Closed);
                }
            }
            // Late result from a call admitted before a reopen; ignore.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call outcome.
    pub fn on_failure(&self) {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut core, &self.policy, false);
                let calls = core.window.len() as u64;
                if calls >= self.policy.minimum_calls
                    && Self::failure_rate(&core) >= self.policy.failure_rate_threshold
                {
                    core.opened_at = Some(self.clock.now());
                    self.transition(&mut core, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // A single failed trial re-opens with a fresh cooldown.
                core.opened_at = Some(self.clock.now());
                self.transition(&mut core, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without side effects (no lazy transition).
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Metrics snapshot for the observability surface.
    pub fn metrics(&self) -> CircuitMetrics {
        let core = self.core.lock();
        CircuitMetrics {
            state: core.state,
            window_calls: core.window.len() as u64,
            window_failures: core.window_failures,
            failure_rate: Self::failure_rate(&core),
            transitions: self.transitions.load(Ordering::Acquire),
        }
    }

    /// Force the breaker back to CLOSED with an empty window.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.window.clear();
        core.window_failures = 0;
        core.opened_at = None;
        core.half_open_admitted = 0;
        core.half_open_successes = 0;
        if core.state != CircuitState::Closed {
            self.transition(&mut core, CircuitState::Closed);
        }
        info!(key = %self.key, "circuit breaker manually reset");
    }

    fn push_outcome(core: &mut CircuitCore, policy: &Policy, success: bool) {
        if core.window.len() == policy.sliding_window_size {
            if let Some(evicted) = core.window.pop_front() {
                if !evicted {
                    core.window_failures -= 1;
                }
            }
        }
        core.window.push_back(success);
        if !success {
            core.window_failures += 1;
        }
    }

    fn failure_rate(core: &CircuitCore) -> u8 {
        if core.window.is_empty() {
            return 0;
        }
        ((core.window_failures * 100) / core.window.len() as u64) as u8
    }

    fn transition(&self, core: &mut CircuitCore, next: CircuitState) {
        let previous = core.state;
        core.state = next;
        self.transitions.fetch_add(1, Ordering::Relaxed);
        match next {
            CircuitState::Open => warn!(
                key = %self.key,
                from = %previous,
                to = %next,
                failures = core.window_failures,
                "circuit opened"
            ),
            CircuitState::Closed => info!(key = %self.key, from = %previous, to = %next, "circuit closed"),
            CircuitState::HalfOpen => debug!(key = %self.key, from = %previous, to = %next, "circuit half-open"),
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn policy(threshold: u8, minimum: u64, wait: Duration, half_open: u32) -> Arc<Policy> {
        Arc::new(Policy {
            failure_rate_threshold: threshold,
            minimum_calls: minimum,
            wait_duration_open: wait,
            permitted_calls_half_open: half_open,
            sliding_window_size: 8,
            ..Policy::default()
        })
    }

    fn breaker(
        threshold: u8,
        minimum: u64,
        wait: Duration,
        half_open: u32,
    ) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let cb = CircuitBreaker::with_clock(
            "test",
            policy(threshold, minimum, wait, half_open),
            clock.clone(),
        );
        (cb, clock)
    }

    #[test]
    fn stays_closed_below_minimum_calls() {
        let (cb, _clock) = breaker(50, 4, Duration::from_secs(1), 2);

        cb.on_failure();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn opens_exactly_once_at_threshold() {
        let (cb, _clock) = breaker(50, 4, Duration::from_secs(1), 2);

        for _ in 0..4 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        let transitions = cb.metrics().transitions;
        assert_eq!(transitions, 1);

        // Further failures do not re-transition.
        cb.on_failure();
        assert_eq!(cb.metrics().transitions, transitions);
    }

    #[test]
    fn open_rejects_with_remaining_cooldown() {
        let (cb, clock) = breaker(50, 4, Duration::from_secs(1), 2);
        for _ in 0..4 {
            cb.on_failure();
        }

        clock.advance(Duration::from_millis(500));
        let retry_after = cb.try_acquire().expect_err("should reject while open");
        assert_eq!(retry_after, Duration::from_millis(500));
    }

    #[test]
    fn recovery_scenario_closes_after_successful_trials() {
        // threshold=50, minimum_calls=4, wait=1s, permitted_half_open=2
        let (cb, clock) = breaker(50, 4, Duration::from_secs(1), 2);

        for _ in 0..4 {
            assert!(cb.try_acquire().is_ok());
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(500));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_millis(600)); // t = 1.1s
        assert!(cb.try_acquire().is_ok(), "trial should be admitted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.try_acquire().is_ok());
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Window was cleared on close.
        assert_eq!(cb.metrics().window_calls, 0);
    }

    #[test]
    fn single_failed_trial_reopens() {
        let (cb, clock) = breaker(50, 4, Duration::from_secs(1), 3);
        for _ in 0..4 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(2));

        assert!(cb.try_acquire().is_ok());
        cb.on_success();
        assert!(cb.try_acquire().is_ok());
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Fresh cooldown started at the failed trial.
        let retry_after = cb.try_acquire().expect_err("should reject");
        assert_eq!(retry_after, Duration::from_secs(1));
    }

    #[test]
    fn half_open_rejects_beyond_permitted_trials() {
        let (cb, clock) = breaker(50, 4, Duration::from_secs(1), 2);
        for _ in 0..4 {
            cb.on_failure();
        }
        clock.advance(Duration::from_secs(2));

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        // Third concurrent trial is rejected as if open.
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn window_slides_and_recovers() {
        // Window of 8; 4 failures then mostly successes should not open.
        let (cb, _clock) = breaker(60, 8, Duration::from_secs(1), 2);
        for _ in 0..4 {
            cb.on_failure();
        }
        for _ in 0..8 {
            cb.on_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().window_failures, 0);
    }

    #[test]
    fn mixed_outcomes_respect_failure_rate() {
        let (cb, _clock) = breaker(50, 4, Duration::from_secs(1), 2);
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_success();
        // 50% failure rate at exactly minimum_calls.
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure();
        // 3/5 = 60% >= 50%.
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn threshold_is_only_evaluated_on_failures() {
        let (cb, _clock) = breaker(50, 4, Duration::from_secs(1), 2);
        cb.on_failure();
        cb.on_failure();
        cb.on_failure();
        // The success completing the minimum window does not open the
        // circuit even though the rate is already past the threshold.
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn reset_returns_to_closed() {
        let (cb, _clock) = breaker(50, 4, Duration::from_secs(1), 2);
        for _ in 0..4 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }
}
