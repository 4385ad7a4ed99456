//! Target detections and the shared detection batch.
//!
//! A [`Detection`] is one target report from one sensor. Sensors accumulate
//! detections into a [`DetectionBatch`] and hand the batch to the fusion
//! engine through the message queue wrapped in an `Arc`: the producer clones
//! the handle before enqueue, the queue stores its own clone, and `pop`
//! transfers that clone to the consumer. The last handle to drop frees the
//! storage, which is the reference-counted ownership model the pipeline is
//! built around.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::FusionError;

/// Sensor id carried by fused snapshot records, marking them as not
/// originating from any single physical sensor.
pub const FUSED_SENSOR_ID: i16 = -1;

/// Classification of a detected target.
///
/// The discriminants are the raw ordinals used on the V2X wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TargetType {
    Vehicle = 0,
    NonVehicle = 1,
    Pedestrian = 2,
    Obstacle = 3,
}

impl TargetType {
    /// Raw wire ordinal.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Geodetic position in WGS-84 degrees and metres.
///
/// Sensors that report in a locally-planar frame (radar polar conversion,
/// camera ground projection) store their planar x/y here as longitude/latitude;
/// the fusion engine treats the pair as a flat plane either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// A single target report from one sensor, or one fused snapshot record.
///
/// `heading` is degrees from East, counter-clockwise positive. `timestamp_us`
/// is microseconds since the Unix epoch, monotonic per source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Stable-within-source target id. For fused records this is the
    /// global track id.
    pub id: u32,
    pub target_type: TargetType,
    pub position: GeoPosition,
    /// Ground speed in m/s.
    pub velocity: f64,
    /// Degrees from East, CCW positive.
    pub heading: f64,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    pub timestamp_us: i64,
    /// Reporting sensor, or [`FUSED_SENSOR_ID`] for fused records.
    pub sensor_id: i16,
}

impl Detection {
    /// Velocity decomposed onto the longitude/latitude axes.
    #[inline]
    pub fn velocity_vector(&self) -> (f64, f64) {
        let heading_rad = self.heading.to_radians();
        (
            self.velocity * heading_rad.cos(),
            self.velocity * heading_rad.sin(),
        )
    }

    /// Validates the detection before it may enter the fusion engine.
    ///
    /// Rejects non-finite fields, out-of-range confidence and sensor ids
    /// that cannot be represented in the sensor bitmask.
    pub fn validate(&self) -> Result<(), FusionError> {
        if !self.position.latitude.is_finite()
            || !self.position.longitude.is_finite()
            || !self.position.altitude.is_finite()
        {
            return Err(FusionError::InvalidDetection("non-finite position"));
        }
        if !self.velocity.is_finite() || !self.heading.is_finite() {
            return Err(FusionError::InvalidDetection("non-finite kinematics"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(FusionError::InvalidDetection("confidence out of range"));
        }
        if !(0..32i16).contains(&self.sensor_id) {
            return Err(FusionError::InvalidDetection("sensor id out of mask range"));
        }
        Ok(())
    }
}

/// Growable, reusable sequence of detections.
///
/// Capacity grows by amortised doubling (`Vec` semantics); [`clear`] drops
/// the contents but keeps the allocation so a producer can refill the same
/// buffer every frame. Shared ownership across the queue boundary is
/// expressed as [`BatchRef`].
///
/// [`clear`]: DetectionBatch::clear
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionBatch {
    detections: Vec<Detection>,
}

/// Shared-owner handle to a batch. Cloning retains, dropping releases.
pub type BatchRef = Arc<DetectionBatch>;

impl DetectionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            detections: Vec::with_capacity(capacity),
        }
    }

    /// Appends a detection, doubling capacity when full.
    pub fn push(&mut self, detection: Detection) {
        self.detections.push(detection);
    }

    /// Sets the length to zero; capacity is unchanged.
    pub fn clear(&mut self) {
        self.detections.clear();
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.detections.capacity()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.detections
    }

    /// Wraps the batch in a shared-owner handle for enqueueing.
    pub fn into_shared(self) -> BatchRef {
        Arc::new(self)
    }
}

impl<'a> IntoIterator for &'a DetectionBatch {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

impl FromIterator<Detection> for DetectionBatch {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        Self {
            detections: iter.into_iter().collect(),
        }
    }
}

/// Wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
