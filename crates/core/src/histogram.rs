//! Lock-free latency histogram feeding the degradation manager.
//!
//! Logarithmic buckets keep the footprint fixed while covering microseconds
//! to minutes. The degradation manager calls [`Histogram::drain`] on each
//! tick, so percentiles describe the most recent sampling interval rather
//! than the whole process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

const NUM_BUCKETS: usize = 48;
const MIN_MICROS: u64 = 1;
const MAX_MICROS: u64 = 600_000_000; // ten minutes

static BUCKET_RATIO_LN: Lazy<f64> = Lazy::new(|| {
    let ratio =
        (MAX_MICROS as f64 / MIN_MICROS as f64).powf(1.0 / (NUM_BUCKETS as f64 - 1.0));
    ratio.ln()
});

fn bucket_for(micros: u64) -> usize {
    if micros <= MIN_MICROS {
        return 0;
    }
    let clamped = micros.min(MAX_MICROS);
    let index = ((clamped as f64 / MIN_MICROS as f64).ln() / *BUCKET_RATIO_LN).floor() as usize;
    index.min(NUM_BUCKETS - 1)
}

fn bucket_midpoint_micros(bucket: usize) -> u64 {
    if bucket == 0 {
        return MIN_MICROS;
    }
    let ratio = BUCKET_RATIO_LN.exp();
    ((MIN_MICROS as f64) * ratio.powf(bucket as f64 + 0.5)).round() as u64
}

/// Concurrent duration histogram with logarithmic buckets.
///
/// Clones share storage, so one handle can record from the hot path while
/// another drains snapshots on a timer.
#[derive(Debug, Clone)]
pub struct Histogram {
    inner: Arc<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    counts: [AtomicU64; NUM_BUCKETS],
    total: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Buckets {
                counts: std::array::from_fn(|_| AtomicU64::new(0)),
                total: AtomicU64::new(0),
                sum_micros: AtomicU64::new(0),
            }),
        }
    }

    /// Record one measurement.
    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros().min(u128::from(MAX_MICROS)) as u64;
        self.inner.counts[bucket_for(micros)].fetch_add(1, Ordering::Relaxed);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Number of measurements recorded since creation or the last drain.
    pub fn count(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Copy out the current distribution without clearing it.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut counts = [0u64; NUM_BUCKETS];
        for (slot, bucket) in counts.iter_mut().zip(self.inner.counts.iter()) {
            *slot = bucket.load(Ordering::Acquire);
        }
        HistogramSnapshot {
            counts,
            total: self.inner.total.load(Ordering::Acquire),
            sum_micros: self.inner.sum_micros.load(Ordering::Acquire),
        }
    }

    /// Copy out the current distribution and reset the histogram, giving a
    /// per-interval view when called on a fixed tick.
    pub fn drain(&self) -> HistogramSnapshot {
        let mut counts = [0u64; NUM_BUCKETS];
        let mut total = 0u64;
        for (slot, bucket) in counts.iter_mut().zip(self.inner.counts.iter()) {
            *slot = bucket.swap(0, Ordering::AcqRel);
            total += *slot;
        }
        // total is rebuilt from the drained buckets so a concurrent record
        // between swaps cannot leave the counters inconsistent.
        self.inner.total.store(0, Ordering::Release);
        let sum_micros = self.inner.sum_micros.swap(0, Ordering::AcqRel);
        HistogramSnapshot { counts, total, sum_micros }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view over a drained or copied distribution.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    counts: [u64; NUM_BUCKETS],
    total: u64,
    sum_micros: u64,
}

impl HistogramSnapshot {
    /// Number of measurements in this snapshot.
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Mean latency, `None` when empty.
    pub fn mean(&self) -> Option<Duration> {
        if self.total == 0 {
            return None;
        }
        Some(Duration::from_micros(self.sum_micros / self.total))
    }

    /// Latency at quantile `q` (0.0..=1.0), `None` when empty or out of
    /// range. Resolution is one logarithmic bucket.
    pub fn percentile(&self, q: f64) -> Option<Duration> {
        if self.total == 0 || !(0.0..=1.0).contains(&q) {
            return None;
        }
        let rank = if q >= 1.0 {
            self.total - 1
        } else {
            ((self.total as f64 - 1.0) * q).ceil().max(0.0) as u64
        };

        let mut seen = 0u64;
        for (bucket, &count) in self.counts.iter().enumerate() {
            seen += count;
            if seen > rank {
                return Some(Duration::from_micros(bucket_midpoint_micros(bucket)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_statistics() {
        let histogram = Histogram::new();
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 0);
        assert_eq!(snapshot.mean(), None);
        assert_eq!(snapshot.percentile(0.99), None);
    }

    #[test]
    fn percentiles_track_the_distribution() {
        let histogram = Histogram::new();
        for millis in 1..=100 {
            histogram.record(Duration::from_millis(millis));
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 100);

        let p50 = snapshot.percentile(0.5).expect("non-empty");
        assert!(p50 >= Duration::from_millis(35) && p50 <= Duration::from_millis(75));

        let p99 = snapshot.percentile(0.99).expect("non-empty");
        assert!(p99 >= Duration::from_millis(85));
    }

    #[test]
    fn drain_resets_for_the_next_interval() {
        let histogram = Histogram::new();
        histogram.record(Duration::from_millis(10));
        histogram.record(Duration::from_millis(20));

        let first = histogram.drain();
        assert_eq!(first.count(), 2);
        assert_eq!(histogram.count(), 0);

        histogram.record(Duration::from_millis(30));
        let second = histogram.drain();
        assert_eq!(second.count(), 1);
    }

    #[test]
    fn clones_share_storage() {
        let a = Histogram::new();
        let b = a.clone();
        a.record(Duration::from_millis(5));
        b.record(Duration::from_millis(6));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn oversized_measurements_are_clamped() {
        let histogram = Histogram::new();
        histogram.record(Duration::from_secs(86_400));
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 1);
        assert!(snapshot.percentile(1.0).is_some());
    }
}
