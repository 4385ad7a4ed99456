//! Millimetre-wave radar wire-frame codec.
//!
//! The radar reports fixed 16-byte big-endian frames over its serial link:
//!
//! ```text
//! u16 range      units of 0.1 m
//! u16 angle      units of 0.1 deg, offset by -180 deg
//! u16 velocity   units of 0.1 m/s
//! i16 rcs        units of 0.1 dBm^2, two's-complement
//! [u8; 8]        reserved
//! ```
//!
//! [`RadarFrameParser`] reassembles frames from an arbitrary byte stream;
//! the serial port itself is owned by the caller.

use tracing::trace;

use crate::detection::{Detection, GeoPosition, TargetType};

/// Fixed on-wire frame length.
pub const RADAR_FRAME_LEN: usize = 16;

/// One decoded radar return in the sensor's polar frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarDetection {
    pub range_m: f64,
    /// Degrees, boresight-relative after the -180 offset.
    pub angle_deg: f64,
    pub velocity_mps: f64,
    pub rcs_dbsm: f64,
}

impl RadarDetection {
    /// Decodes one complete frame.
    pub fn from_frame(frame: &[u8; RADAR_FRAME_LEN]) -> Self {
        Self {
            range_m: u16::from_be_bytes([frame[0], frame[1]]) as f64 * 0.1,
            angle_deg: u16::from_be_bytes([frame[2], frame[3]]) as f64 * 0.1 - 180.0,
            velocity_mps: u16::from_be_bytes([frame[4], frame[5]]) as f64 * 0.1,
            rcs_dbsm: i16::from_be_bytes([frame[6], frame[7]]) as f64 * 0.1,
        }
    }

    /// Polar to locally-planar cartesian coordinates.
    pub fn to_cartesian(&self) -> (f64, f64) {
        let angle_rad = self.angle_deg.to_radians();
        (
            self.range_m * angle_rad.cos(),
            self.range_m * angle_rad.sin(),
        )
    }

    /// Converts the return into a pipeline [`Detection`].
    ///
    /// The planar x/y land in longitude/latitude, heading points along the
    /// line of sight, and confidence is derived from the radar cross
    /// section (strong returns are trusted more).
    pub fn into_detection(self, radar_id: i16, id: u32, timestamp_us: i64) -> Detection {
        let (x, y) = self.to_cartesian();
        Detection {
            id,
            target_type: TargetType::Vehicle,
            position: GeoPosition::new(y, x, 0.0),
            velocity: self.velocity_mps,
            heading: y.atan2(x).to_degrees(),
            confidence: if self.rcs_dbsm > -10.0 { 0.8 } else { 0.5 },
            timestamp_us,
            sensor_id: radar_id,
        }
    }
}

/// Incremental frame reassembly over a raw byte stream.
///
/// Bytes left over after the last complete frame are retained for the next
/// `feed` call.
#[derive(Debug, Default)]
pub struct RadarFrameParser {
    pending: Vec<u8>,
}

impl RadarFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes and returns every now-complete detection.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RadarDetection> {
        self.pending.extend_from_slice(bytes);

        let complete = self.pending.len() / RADAR_FRAME_LEN;
        let mut detections = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(RADAR_FRAME_LEN) {
            let mut frame = [0u8; RADAR_FRAME_LEN];
            frame.copy_from_slice(chunk);
            detections.push(RadarDetection::from_frame(&frame));
        }
        self.pending.drain(..complete * RADAR_FRAME_LEN);
        trace!(
            frames = detections.len(),
            pending = self.pending.len(),
            "radar feed"
        );
        detections
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
