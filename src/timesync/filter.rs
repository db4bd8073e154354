//! Two-state Kalman filter over clock offset and drift
//!
//! Models `server_time ≈ client_time + offset + drift·(client_time − last_update)`.
//! One writer feeds samples through [`TimeFilter::insert`]; any number of
//! readers may call [`TimeFilter::offset`] at the same time. Readers always
//! see a complete state: `insert` computes on a copy and swaps it in under
//! the write lock.

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::FilterConfig;
use crate::error::FilterInputError;

/// Filter state. Times are in microseconds of the client clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeFilterState {
    pub offset: f64,
    pub drift: f64,
    pub offset_covariance: f64,
    pub offset_drift_covariance: f64,
    pub drift_covariance: f64,
    /// Observation time of the last accepted sample
    pub last_update: i64,
    /// Accepted samples; saturates once adaptive forgetting is enabled
    pub count: u8,
    /// Offset gain of the most recent steady-state update
    pub last_offset_gain: f64,
}

impl Default for TimeFilterState {
    fn default() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            offset_covariance: f64::INFINITY,
            offset_drift_covariance: 0.0,
            drift_covariance: 0.0,
            last_update: 0,
            count: 0,
            last_offset_gain: 0.0,
        }
    }
}

impl TimeFilterState {
    /// Apply one sample. The caller has checked that `observed_at` is
    /// after `last_update`.
    fn update(&mut self, config: &FilterConfig, measurement: i64, max_error: i64, observed_at: i64) {
        let dt = (observed_at - self.last_update) as f64;
        let dt_squared = dt * dt;
        self.last_update = observed_at;

        let measurement = measurement as f64;
        let max_error = max_error as f64;
        let measurement_variance = max_error * max_error;

        // First sample: take the measurement as is
        if self.count == 0 {
            self.count = 1;
            self.offset = measurement;
            self.offset_covariance = measurement_variance;
            self.drift = 0.0;
            return;
        }

        // Second sample: drift by finite difference
        if self.count == 1 {
            self.count = 2;
            self.drift = (measurement - self.offset) / dt;
            self.offset = measurement;
            self.drift_covariance = (self.offset_covariance + measurement_variance) / dt_squared;
            self.offset_covariance = measurement_variance;
            return;
        }

        // Predict, F = [1, dt; 0, 1]
        let offset = self.offset + self.drift * dt;
        let mut drift_covariance = self.drift_covariance + dt * config.drift_process_variance;
        let mut offset_drift_covariance =
            self.offset_drift_covariance + self.drift_covariance * dt;
        let mut offset_covariance = self.offset_covariance
            + 2.0 * self.offset_drift_covariance * dt
            + self.drift_covariance * dt_squared
            + dt * config.process_variance;

        let residual = measurement - offset;
        if self.count < config.min_samples_for_forgetting {
            self.count += 1;
        } else if residual.abs() > max_error * config.adaptive_cutoff {
            let factor = config.forget_variance_factor();
            debug!("residual {:.0} above cutoff, forgetting", residual);
            drift_covariance *= factor;
            offset_drift_covariance *= factor;
            offset_covariance *= factor;
        }

        // Update against the single observed dimension, H = [1, 0]
        let uncertainty = 1.0 / (offset_covariance + measurement_variance);
        let offset_gain = offset_covariance * uncertainty;
        let drift_gain = offset_drift_covariance * uncertainty;

        self.offset = offset + offset_gain * residual;
        self.drift += drift_gain * residual;

        self.drift_covariance = drift_covariance - drift_gain * offset_drift_covariance;
        self.offset_drift_covariance = offset_drift_covariance - drift_gain * offset_covariance;
        self.offset_covariance = offset_covariance - offset_gain * offset_covariance;
        self.last_offset_gain = offset_gain;
    }

    /// Offset extrapolated to `client_time`, rounded to whole microseconds
    pub fn offset_at(&self, client_time: i64) -> i64 {
        let dt = (client_time - self.last_update) as f64;
        (self.offset + self.drift * dt).round() as i64
    }
}

/// Clock synchronization filter for one connection
#[derive(Debug)]
pub struct TimeFilter {
    config: FilterConfig,
    state: RwLock<TimeFilterState>,
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl TimeFilter {
    /// Create a filter with no confidence in any offset
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TimeFilterState::default()),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Feed one sample: `measurement` is the observed server-minus-client
    /// offset, `max_error` its error bound, `observed_at` the client time
    /// the sample was taken.
    ///
    /// Samples not strictly after the last accepted one are rejected and
    /// leave the filter untouched.
    pub fn insert(
        &self,
        measurement: i64,
        max_error: i64,
        observed_at: i64,
    ) -> Result<(), FilterInputError> {
        let mut state = self.state.write();
        if observed_at <= state.last_update {
            warn!(
                "Rejecting time sample at {}, last accepted at {}",
                observed_at, state.last_update
            );
            return Err(FilterInputError::NonMonotonicTime {
                last: state.last_update,
                observed: observed_at,
            });
        }

        let mut next = *state;
        next.update(&self.config, measurement, max_error, observed_at);
        *state = next;
        Ok(())
    }

    /// Estimated server-minus-client offset at `client_time`
    pub fn offset(&self, client_time: i64) -> i64 {
        self.state.read().offset_at(client_time)
    }

    /// Server time corresponding to `client_time`
    pub fn server_time(&self, client_time: i64) -> i64 {
        client_time + self.offset(client_time)
    }

    /// Forget everything, as after construction
    pub fn reset(&self) {
        *self.state.write() = TimeFilterState::default();
    }

    /// Whether at least `n` samples were accepted
    pub fn is_warmed_up(&self, n: u8) -> bool {
        self.state.read().count >= n
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> TimeFilterState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const SECOND: i64 = 1_000_000;

    fn config(forget_factor: f64, min_samples: u8) -> FilterConfig {
        FilterConfig::from_std_devs(0.01, 0.0, forget_factor, 0.75, min_samples)
    }

    #[test]
    fn test_fresh_filter() {
        let filter = TimeFilter::default();
        assert_eq!(filter.offset(12345), 0);
        assert!(!filter.is_warmed_up(1));
        assert!(filter.is_warmed_up(0));
        assert!(filter.snapshot().offset_covariance.is_infinite());
    }

    #[test]
    fn test_bootstrap() {
        let filter = TimeFilter::default();
        filter.insert(1000, 10, SECOND).unwrap();

        let state = filter.snapshot();
        assert_eq!(state.count, 1);
        assert_eq!(state.offset, 1000.0);
        assert_eq!(state.offset_covariance, 100.0);
        assert_eq!(state.drift, 0.0);

        filter.insert(1100, 10, 2 * SECOND).unwrap();
        let state = filter.snapshot();
        assert_eq!(state.count, 2);
        assert_eq!(state.offset, 1100.0);
        assert!((state.drift - 100.0 / SECOND as f64).abs() < 1e-15);
        assert_eq!(state.offset_covariance, 100.0);
        assert!(state.drift_covariance > 0.0);
    }

    #[test]
    fn test_constant_measurement_converges() {
        let filter = TimeFilter::default();
        for i in 1..=5 {
            filter.insert(-4321, 5, i * SECOND).unwrap();
        }
        assert_eq!(filter.offset(6 * SECOND), -4321);
        assert!(filter.is_warmed_up(5));
    }

    #[test]
    fn test_tracks_linear_drift() {
        let filter = TimeFilter::default();
        // server runs 100 µs/s fast
        for i in 1..=20 {
            filter.insert(2000 + 100 * i, 20, i * SECOND).unwrap();
        }
        assert_eq!(filter.offset(20 * SECOND), 4000);
        assert_eq!(filter.offset(25 * SECOND), 4500);
        assert_eq!(filter.server_time(25 * SECOND), 25 * SECOND + 4500);
    }

    #[test]
    fn test_non_monotonic_rejected() {
        let filter = TimeFilter::default();
        filter.insert(500, 10, 10 * SECOND).unwrap();
        filter.insert(510, 10, 11 * SECOND).unwrap();
        let before = filter.snapshot();

        assert_eq!(
            filter.insert(9999, 10, 11 * SECOND),
            Err(FilterInputError::NonMonotonicTime {
                last: 11 * SECOND,
                observed: 11 * SECOND
            })
        );
        assert!(filter.insert(9999, 10, 5 * SECOND).is_err());
        assert_eq!(filter.snapshot(), before);
    }

    #[test]
    fn test_non_positive_time_rejected_on_fresh_filter() {
        let filter = TimeFilter::default();
        assert!(filter.insert(1, 1, 0).is_err());
        assert_eq!(filter.snapshot(), TimeFilterState::default());
    }

    #[test]
    fn test_outlier_raises_gain() {
        let warm = |filter: &TimeFilter| {
            for i in 1..=10 {
                filter.insert(1000, 10, i * SECOND).unwrap();
            }
        };

        let steady = TimeFilter::new(config(2.0, 5));
        warm(&steady);
        steady.insert(1000, 10, 11 * SECOND).unwrap();

        let disturbed = TimeFilter::new(config(2.0, 5));
        warm(&disturbed);
        disturbed.insert(5000, 10, 11 * SECOND).unwrap();

        let steady_gain = steady.snapshot().last_offset_gain;
        let disturbed_gain = disturbed.snapshot().last_offset_gain;
        assert!(
            disturbed_gain > steady_gain,
            "{} <= {}",
            disturbed_gain,
            steady_gain
        );
    }

    #[test]
    fn test_forgetting_speeds_reconvergence() {
        let run = |forget_factor: f64| {
            let filter = TimeFilter::new(config(forget_factor, 5));
            for i in 1..=10 {
                filter.insert(1000, 10, i * SECOND).unwrap();
            }
            filter.insert(3000, 10, 11 * SECOND).unwrap();
            (3000 - filter.offset(11 * SECOND)).abs()
        };
        assert!(run(4.0) < run(1.0));
    }

    #[test]
    fn test_no_forgetting_before_min_samples() {
        let filter = TimeFilter::new(config(4.0, 100));
        for i in 1..=10 {
            filter.insert(1000, 10, i * SECOND).unwrap();
        }
        let plain = TimeFilter::new(config(1.0, 100));
        for i in 1..=10 {
            plain.insert(1000, 10, i * SECOND).unwrap();
        }
        filter.insert(3000, 10, 11 * SECOND).unwrap();
        plain.insert(3000, 10, 11 * SECOND).unwrap();

        assert_eq!(filter.snapshot(), plain.snapshot());
        assert_eq!(filter.snapshot().count, 11);
    }

    #[test]
    fn test_count_saturates_at_min_samples() {
        let filter = TimeFilter::new(config(1.001, 4));
        for i in 1..=10 {
            filter.insert(0, 10, i * SECOND).unwrap();
        }
        assert_eq!(filter.snapshot().count, 4);
        assert!(filter.is_warmed_up(4));
        assert!(!filter.is_warmed_up(5));
    }

    #[test]
    fn test_reset_matches_fresh() {
        let filter = TimeFilter::default();
        for i in 1..=8 {
            filter.insert(77 * i, 3, i * SECOND).unwrap();
        }
        filter.reset();

        let fresh = TimeFilter::default();
        assert_eq!(filter.snapshot(), fresh.snapshot());

        // bootstraps again from early times, exactly like a new filter
        for (measurement, at) in [(500, SECOND), (600, 2 * SECOND)] {
            filter.insert(measurement, 10, at).unwrap();
            fresh.insert(measurement, 10, at).unwrap();
        }
        assert_eq!(filter.snapshot(), fresh.snapshot());
        assert_eq!(filter.offset(3 * SECOND), 700);
    }

    #[test]
    fn test_noisy_samples_stay_finite() {
        let filter = TimeFilter::default();
        for i in 1..=200i64 {
            let jitter = if i % 2 == 0 { 40 } else { -40 };
            filter.insert(10_000 + jitter, 50, i * SECOND / 2).unwrap();
        }
        let state = filter.snapshot();
        assert!(state.offset_covariance > 0.0);
        assert!(state.offset.is_finite() && state.drift.is_finite());
    }

    #[test]
    fn test_concurrent_readers_see_whole_states() {
        let filter = Arc::new(TimeFilter::default());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let filter = filter.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let offset = filter.offset(SECOND);
                        assert!(offset == 0 || offset == 777, "torn read: {}", offset);
                    }
                })
            })
            .collect();

        for i in 1..=2000 {
            filter.insert(777, 5, i * 1000).unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(filter.offset(3 * SECOND), 777);
    }
}
