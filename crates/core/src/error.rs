//! Error taxonomy for the execution pipeline.
//!
//! Every rejection carries the resource key and, where it makes sense, a
//! retry-after hint so the caller can build a protocol-appropriate response
//! (HTTP 503 + Retry-After, a system-busy code, ...). The core never produces
//! protocol payloads itself.

use std::time::Duration;

use thiserror::Error;

use crate::degradation::DegradationLevel;

/// Classified failure returned by the execution facade.
///
/// Generic over the wrapped operation error type `E` so the original error is
/// preserved for terminal failures. Stage rejections (circuit, bulkhead, rate
/// limit, shedding) are never retried by the core; only the wrapped
/// operation's own failures go through retry classification.
#[derive(Debug, Error)]
pub enum ExecError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The dependency is known-bad; the call was rejected without invoking
    /// the operation.
    #[error("circuit open for '{key}', retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// Concurrency cap for the resource is exhausted.
    #[error("bulkhead full for '{key}' ({capacity} concurrent calls)")]
    BulkheadFull { key: String, capacity: usize },

    /// Admission quota exceeded.
    #[error("rate limited for '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    /// The attempt deadline elapsed. The operation may still be running
    /// remotely; the outcome must be treated as unknown unless the call was
    /// idempotent.
    #[error("operation on '{key}' timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// Shed before entering the pipeline because the process-wide degradation
    /// level rejects this call class.
    #[error("load shed at degradation level {level}")]
    Overloaded { level: DegradationLevel },

    /// The operation failed with an error classified as not retryable, or
    /// retries were exhausted. Never retried further.
    #[error("operation on '{key}' failed")]
    Terminal {
        key: String,
        #[source]
        source: E,
    },
}

impl<E> ExecError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Retry-after hint, when the rejecting stage can estimate one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Resource key the failure is attributed to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { key, .. }
            | Self::BulkheadFull { key, .. }
            | Self::RateLimited { key, .. }
            | Self::Timeout { key, .. }
            | Self::Terminal { key, .. } => Some(key),
            Self::Overloaded { .. } => None,
        }
    }

    /// True for rejections that happened before the operation was invoked.
    ///
    /// A `Timeout` is not a stage rejection: the operation was started and
    /// its outcome is unknown.
    pub fn is_stage_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::BulkheadFull { .. }
                | Self::RateLimited { .. }
                | Self::Overloaded { .. }
        )
    }
}

/// Result alias for facade calls.
pub type ExecResult<T, E> = Result<T, ExecError<E>>;

/// Policy or registry configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid policy for '{key}': {message}")]
    InvalidPolicy { key: String, message: String },

    #[error("failed to parse policy document: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct TestError;

    #[test]
    fn retry_after_present_for_circuit_and_rate_limit() {
        let err: ExecError<TestError> = ExecError::CircuitOpen {
            key: "db".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        let err: ExecError<TestError> = ExecError::RateLimited {
            key: "db".into(),
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(200)));

        let err: ExecError<TestError> =
            ExecError::BulkheadFull { key: "db".into(), capacity: 4 };
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn stage_rejection_classification() {
        let shed: ExecError<TestError> =
            ExecError::Overloaded { level: DegradationLevel::Emergency };
        assert!(shed.is_stage_rejection());
        assert_eq!(shed.key(), None);

        let timeout: ExecError<TestError> =
            ExecError::Timeout { key: "svc".into(), timeout: Duration::from_secs(1) };
        assert!(!timeout.is_stage_rejection());
        assert_eq!(timeout.key(), Some("svc"));
    }

    #[test]
    fn terminal_preserves_source() {
        let err: ExecError<TestError> =
            ExecError::Terminal { key: "svc".into(), source: TestError };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("svc"));
    }
}
