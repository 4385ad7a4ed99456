//! Camera ground-plane projection.
//!
//! The visual detector reports targets in pixel coordinates; a calibrated
//! 3x3 homography maps them onto the locally-planar world frame shared with
//! the radar. Calibration itself (picking the reference points) happens
//! offline and the resulting matrix arrives via configuration.

use serde::{Deserialize, Serialize};

use crate::detection::GeoPosition;
use crate::error::FusionError;

/// Row-major 3x3 homography from image pixels to world coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerspectiveTransform {
    matrix: [f64; 9],
    calibrated: bool,
}

impl PerspectiveTransform {
    /// A transform that rejects every projection until calibrated.
    pub fn uncalibrated() -> Self {
        Self {
            matrix: [0.0; 9],
            calibrated: false,
        }
    }

    pub fn from_matrix(matrix: [f64; 9]) -> Self {
        Self {
            matrix,
            calibrated: true,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Projects a pixel onto the ground plane.
    pub fn project(&self, pixel_x: f64, pixel_y: f64) -> Result<GeoPosition, FusionError> {
        if !self.calibrated {
            return Err(FusionError::NotCalibrated);
        }
        let m = &self.matrix;
        let w = m[6] * pixel_x + m[7] * pixel_y + m[8];
        if w.abs() < 1e-10 {
            return Err(FusionError::DegenerateProjection);
        }
        let world_x = (m[0] * pixel_x + m[1] * pixel_y + m[2]) / w;
        let world_y = (m[3] * pixel_x + m[4] * pixel_y + m[5]) / w;
        Ok(GeoPosition::new(world_y, world_x, 0.0))
    }
}

impl Default for PerspectiveTransform {
    fn default() -> Self {
        Self::uncalibrated()
    }
}
