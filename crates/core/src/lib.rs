//! Resilience control core.
//!
//! Wraps calls to unreliable downstream resources with composable
//! protection: per-key circuit breaking, bounded concurrency, token-bucket
//! admission, per-attempt timeouts and classified retries, plus a
//! process-wide degradation signal for graceful load shedding.
//!
//! The crate performs no network I/O of its own; it wraps caller-supplied
//! async operations. The usual entry point is [`ExecutionFacade`]:
//!
//! ```no_run
//! use bulwark_core::{CallOptions, ExecutionFacade, PolicyRegistry};
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("transport")]
//! # struct TransportError;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let facade = ExecutionFacade::new(PolicyRegistry::from_toml(
//!     r#"
//!     [resources.primary-db]
//!     critical = true
//!     max_concurrent_calls = 32
//!     "#,
//! )?);
//!
//! let row = facade
//!     .execute(
//!         "primary-db",
//!         CallOptions::default().idempotent(),
//!         |_e: &TransportError| true,
//!         || async { Ok::<_, TransportError>("row") },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Individual components ([`CircuitBreaker`], [`Bulkhead`], [`RateLimiter`],
//! [`TimeoutGuard`], [`RetryExecutor`]) are public for embedders that need
//! a subset of the pipeline.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod degradation;
pub mod error;
pub mod facade;
pub mod histogram;
pub mod policy;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadSlot};
pub use circuit_breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
pub use clock::{Clock, MockClock, SystemClock};
pub use degradation::{
    CircuitHealth, CircuitHealthSource, DegradationConfig, DegradationLevel, DegradationManager,
    MetricSource, NullMetricSource,
};
pub use error::{ConfigError, ConfigResult, ExecError, ExecResult};
pub use facade::{CallOptions, ExecutionFacade, FacadeMetrics, ResourceMetrics};
pub use histogram::{Histogram, HistogramSnapshot};
pub use policy::{Policy, PolicyRegistry};
pub use rate_limiter::{RateLimiter, RateLimiterMetrics};
pub use retry::{CallContext, RetryExecutor};
pub use timeout::{Abandoned, TimeoutGuard};
