//! Process-wide degradation signal.
//!
//! The manager periodically folds CPU utilization, recent p99 latency and
//! circuit health into one of four levels. The level lives in an `AtomicU8`
//! with a single writer (the evaluation) and any number of lock-free
//! readers, so the request hot path can consult it without contention.
//!
//! The core performs no I/O of its own: CPU comes from a caller-supplied
//! [`MetricSource`], latency from the facade's shared [`Histogram`], and
//! circuit health from a [`CircuitHealthSource`] implemented by the facade.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::histogram::Histogram;
use crate::policy::duration_millis;

/// Severity ladder for graceful load shedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DegradationLevel {
    Normal = 0,
    Warning = 1,
    Critical = 2,
    Emergency = 3,
}

impl DegradationLevel {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Warning,
            2 => Self::Critical,
            _ => Self::Emergency,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// Host metrics supplied by the embedding service.
pub trait MetricSource: Send + Sync + 'static {
    /// CPU utilization in `0.0..=1.0`.
    fn cpu_utilization(&self) -> f64;
}

/// Source for deployments that do not wire up host metrics; CPU never
/// contributes to the level.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricSource;

impl MetricSource for NullMetricSource {
    fn cpu_utilization(&self) -> f64 {
        0.0
    }
}

/// Circuit health rollup sampled at each evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitHealth {
    /// Circuits currently OPEN.
    pub open: usize,
    /// Whether any `critical` resource's circuit is OPEN.
    pub critical_open: bool,
}

/// Provider of [`CircuitHealth`], implemented over the facade's arena.
pub trait CircuitHealthSource: Send + Sync + 'static {
    fn circuit_health(&self) -> CircuitHealth;
}

fn default_warning_cpu() -> f64 {
    0.75
}
fn default_critical_cpu() -> f64 {
    0.90
}
fn default_warning_latency() -> Duration {
    Duration::from_millis(500)
}
fn default_critical_latency() -> Duration {
    Duration::from_secs(2)
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(5)
}

/// Thresholds driving the level ladder.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DegradationConfig {
    #[serde(default = "default_warning_cpu")]
    pub warning_cpu: f64,
    #[serde(default = "default_critical_cpu")]
    pub critical_cpu: f64,
    #[serde(default = "default_warning_latency", with = "duration_millis")]
    pub warning_latency: Duration,
    #[serde(default = "default_critical_latency", with = "duration_millis")]
    pub critical_latency: Duration,
    #[serde(default = "default_tick_interval", with = "duration_millis")]
    pub tick_interval: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            warning_cpu: default_warning_cpu(),
            critical_cpu: default_critical_cpu(),
            warning_latency: default_warning_latency(),
            critical_latency: default_critical_latency(),
            tick_interval: default_tick_interval(),
        }
    }
}

/// Evaluates and publishes the process-wide [`DegradationLevel`].
pub struct DegradationManager {
    config: DegradationConfig,
    level: AtomicU8,
    histogram: Histogram,
    metrics: Arc<dyn MetricSource>,
    transitions: AtomicU64,
}

impl DegradationManager {
    /// Manager starting at NORMAL. `histogram` is the facade's shared
    /// latency histogram; each evaluation drains it, so percentiles cover
    /// the elapsed interval only.
    pub fn new(
        config: DegradationConfig,
        histogram: Histogram,
        metrics: Arc<dyn MetricSource>,
    ) -> Self {
        Self {
            config,
            level: AtomicU8::new(DegradationLevel::Normal as u8),
            histogram,
            metrics,
            transitions: AtomicU64::new(0),
        }
    }

    /// Current published level; lock-free.
    pub fn current_level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Whether a call of the given criticality must be shed right now.
    /// Critical calls are exempt even at EMERGENCY.
    pub fn should_shed(&self, critical_call: bool) -> bool {
        !critical_call && self.current_level() == DegradationLevel::Emergency
    }

    /// Level transitions since creation.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Evaluate one tick immediately and publish the resulting level.
    ///
    /// Exposed so tests can drive evaluation deterministically instead of
    /// waiting on the interval task.
    pub fn evaluate_now(&self, circuits: &dyn CircuitHealthSource) -> DegradationLevel {
        let health = circuits.circuit_health();
        let cpu = self.metrics.cpu_utilization();
        let interval = self.histogram.drain();
        let p99 = interval.percentile(0.99);

        let next = self.classify(cpu, p99, health);
        let previous =
            DegradationLevel::from_u8(self.level.swap(next as u8, Ordering::AcqRel));
        if previous != next {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            info!(
                from = %previous,
                to = %next,
                cpu,
                p99 = ?p99,
                open_circuits = health.open,
                "degradation level changed"
            );
        } else {
            debug!(level = %next, cpu, p99 = ?p99, "degradation level unchanged");
        }
        next
    }

    fn classify(
        &self,
        cpu: f64,
        p99: Option<Duration>,
        health: CircuitHealth,
    ) -> DegradationLevel {
        if health.critical_open || health.open > 1 {
            return DegradationLevel::Emergency;
        }
        let latency_at = |threshold: Duration| p99.is_some_and(|value| value >= threshold);
        if cpu >= self.config.critical_cpu
            || latency_at(self.config.critical_latency)
            || health.open > 0
        {
            return DegradationLevel::Critical;
        }
        if cpu >= self.config.warning_cpu || latency_at(self.config.warning_latency) {
            return DegradationLevel::Warning;
        }
        DegradationLevel::Normal
    }

    /// Spawn the periodic evaluation task. The task stops when `shutdown`
    /// fires.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        circuits: Arc<dyn CircuitHealthSource>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        manager.evaluate_now(circuits.as_ref());
                    }
                }
            }
            debug!("degradation ticker stopped");
        })
    }
}

impl fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationManager")
            .field("level", &self.current_level())
            .finish()
    }
}
