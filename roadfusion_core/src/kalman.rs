//! Fixed-gain Kalman core for per-track motion estimation.
//!
//! The state is a constant-acceleration 6-vector `[x, y, vx, vy, ax, ay]`
//! over the locally-planar longitude/latitude axes, with a full 6x6
//! covariance. The filter is deliberately reduced: prediction is exact
//! constant-acceleration kinematics with an additive covariance inflation,
//! and the update uses a fixed scalar gain instead of the full innovation
//! covariance. The fusion engine's job is association and lifecycle, not
//! optimal estimation; a proper EKF can replace this behind the same
//! `predict`/`update` interface.

use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use crate::detection::Detection;

/// Fixed scalar Kalman gain applied to position and velocity corrections.
pub const KALMAN_GAIN: f64 = 0.3;

/// Additive process-noise rate: every covariance entry grows by this per
/// second of prediction.
pub const PROCESS_NOISE_RATE: f64 = 0.1;

/// Initial covariance diagonal: `[x, y, vx, vy, ax, ay]` variances.
const INITIAL_VARIANCE: [f64; 6] = [1.0, 1.0, 0.5, 0.5, 0.1, 0.1];

/// Per-track filter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterState {
    /// `[x, y, vx, vy, ax, ay]`; x is the longitude axis, y the latitude
    /// axis.
    pub state: Vector6<f64>,
    pub covariance: Matrix6<f64>,
    /// Timestamp of the measurement last folded in, microseconds.
    pub last_update_us: i64,
    /// Cleared when the state degrades to NaN; an uninitialized filter is
    /// evicted by the next periodic cycle.
    pub initialized: bool,
}

impl FilterState {
    /// Seeds a filter from the first detection of a track.
    ///
    /// Position comes straight from the measurement, velocity from the
    /// scalar speed decomposed along the heading, acceleration starts at
    /// zero.
    pub fn from_detection(detection: &Detection) -> Self {
        let (vx, vy) = detection.velocity_vector();
        let state = Vector6::new(
            detection.position.longitude,
            detection.position.latitude,
            vx,
            vy,
            0.0,
            0.0,
        );
        Self {
            state,
            covariance: Matrix6::from_diagonal(&Vector6::from_row_slice(&INITIAL_VARIANCE)),
            last_update_us: detection.timestamp_us,
            initialized: true,
        }
    }

    /// Advances the state by `dt` seconds of constant-acceleration motion.
    ///
    /// Every covariance entry inflates by `PROCESS_NOISE_RATE * dt`, so
    /// uncertainty is monotone in `dt` and `predict(0)` leaves the filter
    /// exactly unchanged.
    pub fn predict(&mut self, dt: f64) {
        let s = &mut self.state;
        s[0] += s[2] * dt + 0.5 * s[4] * dt * dt;
        s[1] += s[3] * dt + 0.5 * s[5] * dt * dt;
        s[2] += s[4] * dt;
        s[3] += s[5] * dt;

        self.covariance += Matrix6::from_element(PROCESS_NOISE_RATE * dt);
    }

    /// Folds a measurement into the state with the fixed gain.
    ///
    /// Position is corrected by `K * innovation`. Velocity is blended with
    /// the measured velocity vector only when the measurement advances time
    /// (`dt > 0`), so repeated reports with one timestamp cannot zero the
    /// velocity estimate. The covariance contracts uniformly by `1 - K`.
    pub fn update(&mut self, measurement: &Detection) {
        if !self.initialized {
            return;
        }

        let innovation_x = measurement.position.longitude - self.state[0];
        let innovation_y = measurement.position.latitude - self.state[1];
        self.state[0] += KALMAN_GAIN * innovation_x;
        self.state[1] += KALMAN_GAIN * innovation_y;

        let dt = (measurement.timestamp_us - self.last_update_us) as f64 / 1e6;
        if dt > 0.0 {
            let (vx_m, vy_m) = measurement.velocity_vector();
            self.state[2] = (1.0 - KALMAN_GAIN) * self.state[2] + KALMAN_GAIN * vx_m;
            self.state[3] = (1.0 - KALMAN_GAIN) * self.state[3] + KALMAN_GAIN * vy_m;
        }

        self.covariance *= 1.0 - KALMAN_GAIN;
        self.last_update_us = measurement.timestamp_us;

        if !self.is_finite() {
            self.initialized = false;
        }
    }

    /// True while every state entry is a finite number.
    pub fn is_finite(&self) -> bool {
        self.state.iter().all(|v| v.is_finite())
    }

    /// Planar speed of the current estimate.
    #[inline]
    pub fn speed(&self) -> f64 {
        self.state[2].hypot(self.state[3])
    }

    /// Heading of the current estimate in degrees from East, in
    /// `(-180, 180]`.
    #[inline]
    pub fn heading_deg(&self) -> f64 {
        self.state[3].atan2(self.state[2]).to_degrees()
    }
}
