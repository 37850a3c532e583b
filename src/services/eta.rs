use std::collections::VecDeque;
use std::time::Duration;

/// Per-job completion-time estimator.
///
/// Keeps a bounded sliding window of recent per-item durations and
/// extrapolates a moving average over the remaining items. A bounded
/// window adapts to throughput changes (a run of slow items) instead of
/// averaging over the whole job history.
#[derive(Debug)]
pub struct EtaTracker {
    window: VecDeque<u64>,
    capacity: usize,
}

pub const DEFAULT_WINDOW: usize = 20;

impl EtaTracker {
    pub fn new(capacity: usize) -> Self {
        Self { window: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn record(&mut self, item_duration: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(item_duration.as_millis() as u64);
    }

    /// Estimated seconds until `remaining` more items finish. `None`
    /// until the first sample lands: unknown is reported rather than an
    /// extrapolation from zero data.
    pub fn eta_seconds(&self, remaining: u32) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let avg_millis =
            self.window.iter().sum::<u64>() as f64 / self.window.len() as f64;
        Some(avg_millis * remaining as f64 / 1000.0)
    }
}

impl Default for EtaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_before_first_sample() {
        let tracker = EtaTracker::default();
        assert_eq!(tracker.eta_seconds(10), None);
    }

    #[test]
    fn positive_after_first_sample() {
        let mut tracker = EtaTracker::default();
        tracker.record(Duration::from_millis(500));
        let eta = tracker.eta_seconds(4).unwrap();
        assert!((eta - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn converges_with_fixed_latency() {
        let mut tracker = EtaTracker::default();
        for _ in 0..5 {
            tracker.record(Duration::from_millis(200));
        }
        // 10 items remaining at 200ms each: 2 seconds, within 20%.
        let eta = tracker.eta_seconds(10).unwrap();
        assert!((eta - 2.0).abs() / 2.0 < 0.2);
    }

    #[test]
    fn window_discards_old_samples() {
        let mut tracker = EtaTracker::new(3);
        tracker.record(Duration::from_millis(10_000));
        for _ in 0..3 {
            tracker.record(Duration::from_millis(100));
        }
        // The slow outlier fell out of the window.
        let eta = tracker.eta_seconds(1).unwrap();
        assert!((eta - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_remaining_yields_zero() {
        let mut tracker = EtaTracker::default();
        tracker.record(Duration::from_millis(300));
        assert_eq!(tracker.eta_seconds(0), Some(0.0));
    }
}
