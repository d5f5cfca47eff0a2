//! Adaptive throttle driven by a rolling window of job outcomes.
//!
//! Callers record whether each externally visible action succeeded and
//! scale their own delay ranges by [`AdaptiveThrottle::delay_multiplier`]
//! before the next one. The multiplier grows with the recent failure ratio
//! and always stays within the configured `[min, max]` bounds.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Default rolling window length.
pub const DEFAULT_WINDOW: usize = 20;

/// Inclusive delay range in milliseconds.
///
/// # Example
///
/// ```
/// use drover::throttle::DelayRange;
///
/// let range = DelayRange::new(1000, 2000).scaled(1.5);
/// assert_eq!(range, DelayRange::new(1500, 3000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    /// A range that never waits.
    pub const ZERO: DelayRange = DelayRange {
        min_ms: 0,
        max_ms: 0,
    };

    /// Create a range; bounds given in the wrong order are swapped.
    #[must_use]
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    /// Multiply both bounds by `factor` (negative or NaN factors act as 0).
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = if factor.is_finite() { factor.max(0.0) } else { 0.0 };
        let scale = |ms: u64| (ms as f64 * factor).round() as u64;
        Self::new(scale(self.min_ms), scale(self.max_ms))
    }

    /// Draw a uniformly random delay from the range.
    #[must_use]
    pub fn sample(&self) -> Duration {
        let (low, high) = (self.min_ms.min(self.max_ms), self.min_ms.max(self.max_ms));
        Duration::from_millis(fastrand::u64(low..=high))
    }

    /// Whether the range only contains zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }
}

/// Throttle tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Number of recent outcomes considered.
    pub window: usize,
    /// Multiplier with no recent failures.
    pub min_multiplier: f64,
    /// Multiplier when every recent outcome failed.
    pub max_multiplier: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            min_multiplier: 1.0,
            max_multiplier: 3.0,
        }
    }
}

/// Rolling success/failure telemetry producing a delay-scale multiplier.
///
/// Safe to share behind an `Arc`; both parallel task variants may record
/// into the same throttle.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    window: usize,
    min: f64,
    max: f64,
    outcomes: Mutex<VecDeque<bool>>,
}

impl Default for AdaptiveThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

impl AdaptiveThrottle {
    /// Create a throttle. Swapped bounds are reordered and a zero window is
    /// treated as one.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let (min, max) = sanitize_bounds(config.min_multiplier, config.max_multiplier);
        let window = config.window.max(1);
        Self {
            window,
            min,
            max,
            outcomes: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    /// Append an outcome, evicting the oldest once the window is full.
    pub fn record(&self, success: bool) {
        let mut outcomes = self.lock();
        if outcomes.len() == self.window {
            outcomes.pop_front();
        }
        outcomes.push_back(success);
    }

    /// Fraction of failures in the current window (0.0 when empty).
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        let outcomes = self.lock();
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / outcomes.len() as f64
    }

    /// Current delay multiplier, always within `[min, max]`.
    #[must_use]
    pub fn delay_multiplier(&self) -> f64 {
        let multiplier = self.min + (self.max - self.min) * self.failure_ratio();
        multiplier.clamp(self.min, self.max)
    }

    /// Scale a configured delay range by the current multiplier.
    #[must_use]
    pub fn scale(&self, range: DelayRange) -> DelayRange {
        range.scaled(self.delay_multiplier())
    }

    /// Number of outcomes currently in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bounds.
    #[must_use]
    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<bool>> {
        // A panic while holding the lock cannot leave the deque inconsistent
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sanitize_bounds(min: f64, max: f64) -> (f64, f64) {
    let min = if min.is_finite() { min.max(0.0) } else { 1.0 };
    let max = if max.is_finite() { max.max(0.0) } else { min };
    (min.min(max), min.max(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> AdaptiveThrottle {
        AdaptiveThrottle::new(ThrottleConfig {
            window: 10,
            min_multiplier: 1.0,
            max_multiplier: 4.0,
        })
    }

    #[test]
    fn test_empty_window_yields_min() {
        let throttle = throttle();
        assert!(throttle.is_empty());
        assert_eq!(throttle.delay_multiplier(), 1.0);
    }

    #[test]
    fn test_failures_grow_multiplier_over_successes() {
        let failing = throttle();
        let healthy = throttle();
        for _ in 0..10 {
            failing.record(false);
            healthy.record(true);
        }
        assert!(failing.delay_multiplier() > healthy.delay_multiplier());
        assert_eq!(failing.delay_multiplier(), 4.0);
        assert_eq!(healthy.delay_multiplier(), 1.0);
    }

    #[test]
    fn test_multiplier_stays_in_bounds_for_long_sequences() {
        let throttle = throttle();
        for i in 0..10_000 {
            throttle.record(i % 3 == 0);
            let m = throttle.delay_multiplier();
            assert!((1.0..=4.0).contains(&m), "multiplier {m} out of bounds");
        }
        assert_eq!(throttle.len(), 10);
    }

    #[test]
    fn test_sustained_success_shrinks_multiplier() {
        let throttle = throttle();
        for _ in 0..10 {
            throttle.record(false);
        }
        let stressed = throttle.delay_multiplier();
        for _ in 0..10 {
            throttle.record(true);
        }
        assert!(throttle.delay_multiplier() < stressed);
        assert_eq!(throttle.delay_multiplier(), 1.0);
    }

    #[test]
    fn test_half_failures_is_midpoint() {
        let throttle = throttle();
        for i in 0..10 {
            throttle.record(i % 2 == 0);
        }
        assert!((throttle.delay_multiplier() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_swapped_bounds_are_reordered() {
        let throttle = AdaptiveThrottle::new(ThrottleConfig {
            window: 0,
            min_multiplier: 5.0,
            max_multiplier: 2.0,
        });
        assert_eq!(throttle.bounds(), (2.0, 5.0));
        throttle.record(false);
        throttle.record(false);
        assert_eq!(throttle.len(), 1);
        assert_eq!(throttle.delay_multiplier(), 5.0);
    }

    #[test]
    fn test_scale_applies_multiplier() {
        let throttle = throttle();
        for _ in 0..10 {
            throttle.record(false);
        }
        assert_eq!(
            throttle.scale(DelayRange::new(100, 200)),
            DelayRange::new(400, 800)
        );
    }

    #[test]
    fn test_delay_range_sample_within_bounds() {
        let range = DelayRange::new(50, 75);
        for _ in 0..100 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(75));
        }
        assert_eq!(DelayRange::ZERO.sample(), Duration::ZERO);
    }

    #[test]
    fn test_delay_range_new_swaps() {
        assert_eq!(DelayRange::new(9, 3), DelayRange::new(3, 9));
        assert_eq!(DelayRange::new(5, 5).scaled(f64::NAN), DelayRange::ZERO);
    }
}
