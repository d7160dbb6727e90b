//! Per-resource concurrency cap.
//!
//! A tokio semaphore bounds in-flight calls per key. Slots are RAII: the
//! permit inside [`BulkheadSlot`] releases on drop on every exit path,
//! including cancellation mid-await, so a slot can never leak.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::policy::Policy;

/// Snapshot of one bulkhead for the metrics surface.
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    pub capacity: usize,
    pub in_flight: usize,
    pub admitted: u64,
    pub rejected: u64,
    /// Rejections that queued first and gave up at `max_queue_wait`.
    pub queue_timeouts: u64,
}

/// Held concurrency slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct BulkheadSlot {
    _permit: OwnedSemaphorePermit,
}

/// Semaphore-backed concurrency limit for a single resource key.
#[derive(Debug)]
pub struct Bulkhead {
    key: String,
    capacity: usize,
    max_queue_wait: Duration,
    semaphore: Arc<Semaphore>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    queue_timeouts: AtomicU64,
}

impl Bulkhead {
    pub fn new(key: impl Into<String>, policy: &Policy) -> Self {
        Self {
            key: key.into(),
            capacity: policy.max_concurrent_calls,
            max_queue_wait: policy.max_queue_wait,
            semaphore: Arc::new(Semaphore::new(policy.max_concurrent_calls)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            queue_timeouts: AtomicU64::new(0),
        }
    }

    /// Acquire a slot, queueing up to `max_queue_wait` when the cap is hit.
    ///
    /// `None` means the call must be rejected as bulkhead-full. With a zero
    /// queue wait the rejection is immediate.
    pub async fn acquire(&self) -> Option<BulkheadSlot> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Some(BulkheadSlot { _permit: permit });
        }

        if self.max_queue_wait.is_zero() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, capacity = self.capacity, "bulkhead rejected call");
            return None;
        }

        match tokio::time::timeout(
            self.max_queue_wait,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            // The semaphore is never closed, so the inner error is
            // unreachable; treat it like a timeout.
            Ok(Ok(permit)) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                Some(BulkheadSlot { _permit: permit })
            }
            Ok(Err(_)) | Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %self.key,
                    capacity = self.capacity,
                    queue_wait = ?self.max_queue_wait,
                    "bulkhead queue wait elapsed"
                );
                None
            }
        }
    }

    /// Configured concurrency cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            capacity: self.capacity,
            in_flight: self.in_flight(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
        }
    }
}
