//! Monotonic microsecond timebase.
//!
//! Every timing decision in the pipeline (frame release, sync error, drift
//! estimation) reads the same clock through the [`Clock`] trait so tests can
//! substitute a manually advanced clock and replay scenarios deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic microsecond clock.
///
/// Implementations must never go backwards for the lifetime of the process.
/// Wall-clock time is deliberately not exposed here; event timestamps use
/// [`crate::utils::now_millis`] instead.
pub trait Clock: Send + Sync {
    /// Returns microseconds elapsed on a monotonically non-decreasing timeline.
    fn now_us(&self) -> u64;
}

/// Process-wide monotonic clock backed by [`Instant`].
///
/// The zero point is the moment the clock was created, which keeps values
/// comfortably inside `u64` and makes log output readable.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor returning the clock behind an `Arc<dyn Clock>`.
    #[must_use]
    pub fn arc() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for deterministic tests.
///
/// `advance_us` only moves forward; attempts to rewind are ignored so the
/// monotonicity contract holds even for sloppy test code.
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at `start_us`.
    #[must_use]
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    /// Convenience constructor returning an `Arc<ManualClock>`.
    #[must_use]
    pub fn arc(start_us: u64) -> Arc<Self> {
        Arc::new(Self::new(start_us))
    }

    /// Advances the clock by `delta_us` microseconds.
    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    /// Sets the clock to `target_us` if that is not in the past.
    pub fn set_us(&self, target_us: u64) {
        self.now_us.fetch_max(target_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_decreases() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_us();
        for _ in 0..1000 {
            let now = clock.now_us();
            assert!(now >= prev, "clock went backwards: {prev} -> {now}");
            prev = now;
        }
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_us(), 1_000);
        clock.advance_us(500);
        assert_eq!(clock.now_us(), 1_500);
    }

    #[test]
    fn manual_clock_ignores_rewind() {
        let clock = ManualClock::new(2_000);
        clock.set_us(1_000);
        assert_eq!(clock.now_us(), 2_000);
        clock.set_us(3_000);
        assert_eq!(clock.now_us(), 3_000);
    }
}
