//! Ring-buffer latency tracker.
//!
//! A fixed ring of integer samples written lock-free by any number of
//! producers; once full, new samples overwrite the oldest slot. Statistics
//! snapshot the occupied slice, sort a copy, and report average/p95/p99.
//! The sort dominates statistic cost; statistics are read rarely relative
//! to writes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Point-in-time latency statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStatistics {
    /// Mean of the occupied slots.
    pub average: f64,
    /// 95th percentile sample.
    pub p95: u64,
    /// 99th percentile sample.
    pub p99: u64,
    /// Number of occupied slots in the snapshot.
    pub samples: usize,
}

impl LatencyStatistics {
    fn empty() -> Self {
        Self {
            average: 0.0,
            p95: 0,
            p99: 0,
            samples: 0,
        }
    }
}

/// Concurrent fixed-capacity ring of latency samples.
pub struct LatencyTracker {
    slots: Box<[AtomicU64]>,
    next: AtomicU64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LatencyTracker {
    /// Create a tracker with the given ring capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            slots,
            next: AtomicU64::new(0),
        }
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record one sample, overwriting the oldest slot once full.
    pub fn record(&self, latency: u64) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) as usize % self.slots.len();
        self.slots[index].store(latency, Ordering::Relaxed);
    }

    /// Snapshot the occupied slots and compute statistics.
    ///
    /// Percentile rule: for `n` samples sorted ascending, percentile `q` is
    /// the value at index `floor(n × q)` clamped to `n - 1`. All zeros when
    /// no samples have been recorded.
    pub fn statistics(&self) -> LatencyStatistics {
        let recorded = self.next.load(Ordering::Relaxed) as usize;
        let occupied = recorded.min(self.slots.len());
        if occupied == 0 {
            return LatencyStatistics::empty();
        }

        let mut snapshot: Vec<u64> = self.slots[..occupied]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        snapshot.sort_unstable();

        let sum: u128 = snapshot.iter().map(|&v| v as u128).sum();
        let average = sum as f64 / occupied as f64;

        LatencyStatistics {
            average,
            p95: snapshot[percentile_index(occupied, 0.95)],
            p99: snapshot[percentile_index(occupied, 0.99)],
            samples: occupied,
        }
    }
}

fn percentile_index(n: usize, q: f64) -> usize {
    ((n as f64 * q).floor() as usize).min(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_tracker_reports_zeros() {
        let tracker = LatencyTracker::default();
        let stats = tracker.statistics();
        assert_eq!(stats, LatencyStatistics::empty());
    }

    #[test]
    fn test_percentile_index_rule() {
        assert_eq!(percentile_index(1, 0.95), 0);
        assert_eq!(percentile_index(20, 0.95), 19);
        assert_eq!(percentile_index(100, 0.95), 95);
        assert_eq!(percentile_index(100, 0.99), 99);
        assert_eq!(percentile_index(10, 0.99), 9);
    }

    #[test]
    fn test_statistics_match_sorted_samples() {
        let tracker = LatencyTracker::new(128);
        // 1..=100 in arbitrary order.
        for i in (1..=100u64).rev() {
            tracker.record(i);
        }

        let stats = tracker.statistics();
        assert_eq!(stats.samples, 100);
        assert!((stats.average - 50.5).abs() < f64::EPSILON);
        // floor(100 * 0.95) = 95 -> sorted[95] = 96
        assert_eq!(stats.p95, 96);
        // floor(100 * 0.99) = 99 -> sorted[99] = 100
        assert_eq!(stats.p99, 100);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let tracker = LatencyTracker::new(4);
        for i in 1..=6u64 {
            tracker.record(i);
        }
        // Slots now hold 5, 6, 3, 4.
        let stats = tracker.statistics();
        assert_eq!(stats.samples, 4);
        assert!((stats.average - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_sample() {
        let tracker = LatencyTracker::default();
        tracker.record(42);
        let stats = tracker.statistics();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.p95, 42);
        assert_eq!(stats.p99, 42);
        assert!((stats.average - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_recording() {
        let tracker = Arc::new(LatencyTracker::new(1024));
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        tracker.record(i % 100);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stats = tracker.statistics();
        assert_eq!(stats.samples, 1024);
        assert!(stats.p95 < 100);
        assert!(stats.p99 < 100);
    }
}
