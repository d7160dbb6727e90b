//! Per-attempt deadline guard.
//!
//! Each attempt races against its deadline and a caller-supplied
//! cancellation token. On expiry the wrapped future is dropped, abandoning
//! the attempt; the guard never waits past the deadline for cooperative
//! cleanup, and the eventual remote outcome is unknown to the caller.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why a guarded attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandoned {
    /// The attempt deadline elapsed.
    Deadline,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Deadline enforcement for attempts against one resource key.
#[derive(Debug)]
pub struct TimeoutGuard {
    key: String,
    timeout: Duration,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

impl TimeoutGuard {
    pub fn new(key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            timeout,
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
        }
    }

    /// Configured per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attempts abandoned at their deadline so far.
    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Run one attempt under the configured deadline.
    pub async fn run<F, T>(&self, cancel: &CancellationToken, attempt: F) -> Result<T, Abandoned>
    where
        F: Future<Output = T>,
    {
        self.run_with_limit(self.timeout, cancel, attempt).await
    }

    /// Run one attempt under an explicit deadline, used when an overall call
    /// deadline leaves less time than the configured per-attempt timeout.
    pub async fn run_with_limit<F, T>(
        &self,
        limit: Duration,
        cancel: &CancellationToken,
        attempt: F,
    ) -> Result<T, Abandoned>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            () = cancel.cancelled() => {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
                warn!(key = %self.key, "attempt cancelled by caller");
                Err(Abandoned::Cancelled)
            }
            outcome = tokio::time::timeout(limit, attempt) => match outcome {
                Ok(value) => Ok(value),
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %self.key, limit = ?limit, "attempt abandoned at deadline");
                    Err(Abandoned::Deadline)
                }
            }
        }
    }
}
