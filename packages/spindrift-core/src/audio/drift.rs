//! Clock drift estimation from sync-error samples.
//!
//! A two-state Kalman filter tracks (offset, drift) of the stream clock
//! against the device clock, fed with the timed buffer's smoothed sync error
//! at the device callback rate. Drift in microseconds per second is
//! numerically identical to parts per million, so `drift_us_per_s` doubles as
//! the ppm figure handed to the resampler.
//!
//! A reanchor (stream seek / transport reset) clears the offset state but
//! keeps the drift estimate and its covariance: the clocks did not change,
//! only the timeline did, and keeping the learned rate gives fast re-lock.

use serde::Serialize;

/// Minimum updates before the estimate may be called reliable.
const MIN_UPDATES: u64 = 50;

/// Minimum observation window before the estimate may be called reliable (10s).
const MIN_WINDOW_US: u64 = 10_000_000;

/// Drift-variance threshold for reliability, in (us/s)^2.
///
/// sigma = 5 us/s means the filter trusts its rate to about 5 ppm.
const RELIABLE_DRIFT_VARIANCE: f64 = 25.0;

/// Published estimator output.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClockSyncStatus {
    /// Filtered clock offset in microseconds.
    pub smoothed_error_us: f64,
    /// Estimated drift rate in microseconds per second (equals ppm).
    pub drift_us_per_s: f64,
    /// True once the drift estimate has converged.
    pub is_drift_reliable: bool,
}

/// Tunables for the drift filter.
///
/// Defaults are tuned for 20ms device callbacks with the 200ms pre-smoothed
/// error input: process noise low enough to average out scheduler jitter,
/// measurement noise matching observed callback scatter.
#[derive(Debug, Clone, Copy)]
pub struct DriftFilterConfig {
    /// Process noise spectral density for the offset state.
    pub process_noise_offset: f64,
    /// Process noise spectral density for the drift state.
    pub process_noise_drift: f64,
    /// Measurement noise variance in us^2.
    pub measurement_noise: f64,
    /// Initial variance of the offset state.
    pub initial_offset_variance: f64,
    /// Initial variance of the drift state.
    pub initial_drift_variance: f64,
}

impl Default for DriftFilterConfig {
    fn default() -> Self {
        Self {
            process_noise_offset: 50.0,
            process_noise_drift: 0.05,
            measurement_noise: 40_000.0,
            initial_offset_variance: 1.0e6,
            initial_drift_variance: 1.0e4,
        }
    }
}

/// Two-state Kalman filter over (offset_us, drift_us_per_s).
pub struct DriftEstimator {
    config: DriftFilterConfig,
    /// State: clock offset in microseconds.
    offset_us: f64,
    /// State: drift in microseconds per second.
    drift_us_per_s: f64,
    /// Covariance matrix [[p00, p01], [p10, p11]], symmetric.
    p: [[f64; 2]; 2],
    updates: u64,
    /// Total observation time absorbed, accumulated across reanchors.
    observed_us: u64,
    last_update_us: Option<u64>,
}

impl DriftEstimator {
    /// Creates an estimator with the given tunables.
    #[must_use]
    pub fn new(config: DriftFilterConfig) -> Self {
        Self {
            config,
            offset_us: 0.0,
            drift_us_per_s: 0.0,
            p: [
                [config.initial_offset_variance, 0.0],
                [0.0, config.initial_drift_variance],
            ],
            updates: 0,
            observed_us: 0,
            last_update_us: None,
        }
    }

    /// Absorbs one sync-error measurement taken at monotonic time `now_us`.
    ///
    /// `error_us` is the buffer's smoothed scheduled-vs-actual error
    /// (positive = behind). Out-of-order timestamps are ignored.
    pub fn update(&mut self, error_us: f64, now_us: u64) {
        if !error_us.is_finite() {
            return;
        }
        let dt_us = match self.last_update_us {
            Some(last) if now_us <= last => return,
            Some(last) => now_us - last,
            None => {
                // First sample on this timeline: seed the offset, keep the
                // drift state and covariance untouched.
                self.last_update_us = Some(now_us);
                self.offset_us = error_us;
                self.updates += 1;
                return;
            }
        };
        self.last_update_us = Some(now_us);
        self.observed_us += dt_us;
        let dt_s = dt_us as f64 / 1_000_000.0;

        // Predict: offset integrates drift; covariance grows with Q.
        self.offset_us += self.drift_us_per_s * dt_s;
        let q00 = self.config.process_noise_offset * dt_s;
        let q11 = self.config.process_noise_drift * dt_s;
        // P = F P F' + Q with F = [[1, dt], [0, 1]]
        let p00 = self.p[0][0] + dt_s * (self.p[1][0] + self.p[0][1]) + dt_s * dt_s * self.p[1][1];
        let p01 = self.p[0][1] + dt_s * self.p[1][1];
        let p10 = self.p[1][0] + dt_s * self.p[1][1];
        let p11 = self.p[1][1];
        self.p = [[p00 + q00, p01], [p10, p11 + q11]];

        // Update with H = [1, 0].
        let innovation = error_us - self.offset_us;
        let s = self.p[0][0] + self.config.measurement_noise;
        let k0 = self.p[0][0] / s;
        let k1 = self.p[1][0] / s;
        self.offset_us += k0 * innovation;
        self.drift_us_per_s += k1 * innovation;
        let p00 = (1.0 - k0) * self.p[0][0];
        let p01 = (1.0 - k0) * self.p[0][1];
        let p10 = self.p[1][0] - k1 * self.p[0][0];
        let p11 = self.p[1][1] - k1 * self.p[0][1];
        self.p = [[p00, p01], [p10, p11]];

        self.updates += 1;
    }

    /// Estimated drift in ppm (identical to microseconds per second).
    #[must_use]
    pub fn drift_ppm(&self) -> f64 {
        self.drift_us_per_s
    }

    /// Filtered clock offset in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> f64 {
        self.offset_us
    }

    /// True once the drift variance is below threshold and enough samples
    /// over a long enough window have been absorbed.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.updates >= MIN_UPDATES
            && self.observed_us >= MIN_WINDOW_US
            && self.p[1][1] < RELIABLE_DRIFT_VARIANCE
    }

    /// Published status snapshot.
    #[must_use]
    pub fn status(&self) -> ClockSyncStatus {
        ClockSyncStatus {
            smoothed_error_us: self.offset_us,
            drift_us_per_s: self.drift_us_per_s,
            is_drift_reliable: self.is_reliable(),
        }
    }

    /// Clears the offset state after a timeline jump, preserving drift.
    ///
    /// The drift state and its variance survive so reliability (and the
    /// resampler's drift term) carry straight over to the new timeline.
    pub fn reanchor(&mut self) {
        self.offset_us = 0.0;
        self.p[0][0] = self.config.initial_offset_variance;
        self.p[0][1] = 0.0;
        self.p[1][0] = 0.0;
        // Timestamps restart so the next update re-seeds the offset instead
        // of treating the jump as a huge innovation.
        self.last_update_us = None;
    }
}

impl Default for DriftEstimator {
    fn default() -> Self {
        Self::new(DriftFilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `estimator` a clean constant-drift error ramp at 20ms intervals.
    fn feed_constant_drift(
        estimator: &mut DriftEstimator,
        drift_ppm: f64,
        seconds: f64,
        start_us: u64,
    ) -> u64 {
        let step_us = 20_000u64;
        let steps = (seconds * 50.0) as u64;
        let mut now = start_us;
        for i in 0..=steps {
            let t_s = (i * step_us) as f64 / 1_000_000.0;
            let error_us = drift_ppm * t_s;
            estimator.update(error_us, now);
            now += step_us;
        }
        now
    }

    #[test]
    fn converges_to_injected_drift_within_15s() {
        let mut estimator = DriftEstimator::default();
        feed_constant_drift(&mut estimator, 50.0, 15.0, 1_000_000);
        assert!(
            (estimator.drift_ppm() - 50.0).abs() < 5.0,
            "estimated {} ppm, wanted 50 +/- 5",
            estimator.drift_ppm()
        );
        assert!(estimator.is_reliable());
    }

    #[test]
    fn unreliable_before_minimum_window() {
        let mut estimator = DriftEstimator::default();
        // Only 2 seconds of data: plenty of updates, window too short.
        feed_constant_drift(&mut estimator, 50.0, 2.0, 1_000_000);
        assert!(!estimator.is_reliable());
    }

    #[test]
    fn zero_drift_estimates_near_zero() {
        let mut estimator = DriftEstimator::default();
        feed_constant_drift(&mut estimator, 0.0, 15.0, 1_000_000);
        assert!(estimator.drift_ppm().abs() < 2.0);
    }

    #[test]
    fn reanchor_preserves_drift_clears_offset() {
        let mut estimator = DriftEstimator::default();
        let end = feed_constant_drift(&mut estimator, 100.0, 20.0, 1_000_000);
        let drift_before = estimator.drift_ppm();
        assert!(estimator.is_reliable());

        estimator.reanchor();
        assert_eq!(estimator.offset_us(), 0.0);
        assert!((estimator.drift_ppm() - drift_before).abs() < f64::EPSILON);
        assert!(estimator.is_reliable(), "reliability must survive reanchor");

        // Fast re-lock: 2s of new-timeline data keeps the estimate close.
        feed_constant_drift(&mut estimator, 100.0, 2.0, end + 1_000);
        assert!(
            (estimator.drift_ppm() - 100.0).abs() < 20.0,
            "re-lock drifted to {} ppm",
            estimator.drift_ppm()
        );
    }

    #[test]
    fn ignores_non_finite_and_stale_samples() {
        let mut estimator = DriftEstimator::default();
        estimator.update(10.0, 1_000_000);
        estimator.update(f64::NAN, 1_020_000);
        estimator.update(20.0, 1_000_000); // stale timestamp
        estimator.update(30.0, 1_040_000);
        assert!(estimator.drift_ppm().is_finite());
    }
}
