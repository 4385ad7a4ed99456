//! V2X Roadside-Safety-Message (RSM) encoder.
//!
//! Serializes a fused snapshot into the flat big-endian frame broadcast by
//! the RSU. Layout:
//!
//! ```text
//! Header (15 bytes):
//!   u8  magic        = 0x56 ('V')
//!   u8  version
//!   u8  msg_type     = 0x01 (RSM)
//!   u32 device_id
//!   u64 timestamp_ms
//! Body:
//!   u8  count
//!   count x participant (16 bytes):
//!     u16 target_id    low 16 bits of the global id
//!     u8  type         raw enum ordinal
//!     i32 lat          degrees x 1e7
//!     i32 lon          degrees x 1e7
//!     u16 speed        units of 0.02 m/s, saturating
//!     u16 heading      degrees mod 360, units of 0.0125 deg
//!     u8  confidence   confidence x 200, clamped
//! ```
//!
//! Participants that do not fit in the output buffer are silently dropped;
//! the count byte always reflects the number actually written.

use crate::detection::{Detection, DetectionBatch};
use crate::error::FusionError;

pub const RSM_MAGIC: u8 = 0x56; // 'V'
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const MSG_TYPE_RSM: u8 = 0x01;

pub const HEADER_LEN: usize = 15;
pub const PARTICIPANT_LEN: usize = 16;

/// The count byte caps the participant list.
pub const MAX_PARTICIPANTS: usize = 255;

/// Encodes a snapshot into `out`, returning the number of bytes written.
///
/// `timestamp_ms` is the broadcast time in milliseconds since the Unix
/// epoch; the caller supplies it so frames are reproducible under test.
/// Fails with [`FusionError::BufferTooSmall`] only when the header plus the
/// count byte do not fit; an undersized remainder truncates the participant
/// list instead.
pub fn encode_rsm(
    tracks: &DetectionBatch,
    rsu_id: u32,
    timestamp_ms: u64,
    out: &mut [u8],
) -> Result<usize, FusionError> {
    let min_len = HEADER_LEN + 1;
    if out.len() < min_len {
        return Err(FusionError::BufferTooSmall {
            needed: min_len,
            available: out.len(),
        });
    }

    out[0] = RSM_MAGIC;
    out[1] = PROTOCOL_VERSION;
    out[2] = MSG_TYPE_RSM;
    out[3..7].copy_from_slice(&rsu_id.to_be_bytes());
    out[7..15].copy_from_slice(&timestamp_ms.to_be_bytes());

    let count_pos = HEADER_LEN;
    let mut pos = HEADER_LEN + 1;

    let mut written: usize = 0;
    for track in tracks.iter().take(MAX_PARTICIPANTS) {
        if pos + PARTICIPANT_LEN > out.len() {
            break;
        }
        encode_participant(track, &mut out[pos..pos + PARTICIPANT_LEN]);
        pos += PARTICIPANT_LEN;
        written += 1;
    }

    out[count_pos] = written as u8;
    Ok(pos)
}

fn encode_participant(track: &Detection, out: &mut [u8]) {
    out[0..2].copy_from_slice(&((track.id & 0xFFFF) as u16).to_be_bytes());
    out[2] = track.target_type.as_u8();

    let lat = scale_degrees(track.position.latitude);
    let lon = scale_degrees(track.position.longitude);
    out[3..7].copy_from_slice(&lat.to_be_bytes());
    out[7..11].copy_from_slice(&lon.to_be_bytes());

    let speed = (track.velocity / 0.02).round().clamp(0.0, u16::MAX as f64) as u16;
    out[11..13].copy_from_slice(&speed.to_be_bytes());

    let heading = (track.heading.rem_euclid(360.0) / 0.0125)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16;
    out[13..15].copy_from_slice(&heading.to_be_bytes());

    out[15] = (track.confidence * 200.0).round().clamp(0.0, 200.0) as u8;
}

/// Degrees to the 1e-7-degree wire unit, saturating at the i32 range.
fn scale_degrees(degrees: f64) -> i32 {
    (degrees * 1e7)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, GeoPosition, TargetType, FUSED_SENSOR_ID};

    fn track(id: u32, lat: f64, lon: f64, v: f64, heading: f64, conf: f64) -> Detection {
        Detection {
            id,
            target_type: TargetType::Pedestrian,
            position: GeoPosition::new(lat, lon, 0.0),
            velocity: v,
            heading,
            confidence: conf,
            timestamp_us: 0,
            sensor_id: FUSED_SENSOR_ID,
        }
    }

    fn snapshot(n: usize) -> DetectionBatch {
        (0..n)
            .map(|i| track(i as u32 + 1, 40.0, 116.0, 10.0, 90.0, 0.9))
            .collect()
    }

    #[test]
    fn header_layout() {
        let mut buf = [0u8; 64];
        let len = encode_rsm(&snapshot(0), 0xA1B2C3D4, 0x0102030405060708, &mut buf).unwrap();
        assert_eq!(len, HEADER_LEN + 1);
        assert_eq!(buf[0], 0x56);
        assert_eq!(buf[1], PROTOCOL_VERSION);
        assert_eq!(buf[2], MSG_TYPE_RSM);
        assert_eq!(&buf[3..7], &[0xA1, 0xB2, 0xC3, 0xD4]);
        assert_eq!(&buf[7..15], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[15], 0);
    }

    #[test]
    fn participant_fields_big_endian() {
        let mut buf = [0u8; 64];
        let one = snapshot(1);
        let len = encode_rsm(&one, 1, 0, &mut buf).unwrap();
        assert_eq!(len, HEADER_LEN + 1 + PARTICIPANT_LEN);

        let p = &buf[16..32];
        assert_eq!(u16::from_be_bytes([p[0], p[1]]), 1);
        assert_eq!(p[2], TargetType::Pedestrian.as_u8());
        assert_eq!(i32::from_be_bytes([p[3], p[4], p[5], p[6]]), 400_000_000);
        assert_eq!(i32::from_be_bytes([p[7], p[8], p[9], p[10]]), 1_160_000_000);
        assert_eq!(u16::from_be_bytes([p[11], p[12]]), 500); // 10 m/s / 0.02
        assert_eq!(u16::from_be_bytes([p[13], p[14]]), 7200); // 90 deg / 0.0125
        assert_eq!(p[15], 180); // 0.9 * 200
    }

    #[test]
    fn target_id_keeps_low_16_bits() {
        let mut buf = [0u8; 64];
        let batch: DetectionBatch = [track(0x0003_0007, 0.0, 0.0, 0.0, 0.0, 1.0)]
            .into_iter()
            .collect();
        encode_rsm(&batch, 1, 0, &mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[16], buf[17]]), 0x0007);
    }

    #[test]
    fn negative_coordinates_roundtrip_sign() {
        let mut buf = [0u8; 64];
        let batch: DetectionBatch = [track(1, -33.8688, -151.2093, 0.0, 0.0, 1.0)]
            .into_iter()
            .collect();
        encode_rsm(&batch, 1, 0, &mut buf).unwrap();
        let lat = i32::from_be_bytes([buf[19], buf[20], buf[21], buf[22]]);
        assert_eq!(lat, -338_688_000);
    }

    #[test]
    fn speed_saturates() {
        let mut buf = [0u8; 64];
        let batch: DetectionBatch = [track(1, 0.0, 0.0, 10_000.0, 0.0, 1.0)]
            .into_iter()
            .collect();
        encode_rsm(&batch, 1, 0, &mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[27], buf[28]]), u16::MAX);
    }

    #[test]
    fn heading_wraps_into_unit_range() {
        let mut buf = [0u8; 64];
        let batch: DetectionBatch = [track(1, 0.0, 0.0, 0.0, -90.0, 1.0)].into_iter().collect();
        encode_rsm(&batch, 1, 0, &mut buf).unwrap();
        // -90 deg == 270 deg -> 270 / 0.0125
        assert_eq!(u16::from_be_bytes([buf[29], buf[30]]), 21_600);
    }

    #[test]
    fn buffer_too_small_for_header() {
        let mut buf = [0u8; 10];
        assert!(matches!(
            encode_rsm(&snapshot(1), 1, 0, &mut buf),
            Err(FusionError::BufferTooSmall { needed: 16, .. })
        ));
    }

    #[test]
    fn truncation_fixes_count_byte() {
        // 512 bytes: header + count + 31 participants exactly.
        let mut buf = [0u8; 512];
        let len = encode_rsm(&snapshot(300), 1, 0, &mut buf).unwrap();
        assert_eq!(buf[15], 31);
        assert_eq!(len, HEADER_LEN + 1 + 31 * PARTICIPANT_LEN);
        assert_eq!(len, 512);
    }

    #[test]
    fn count_saturates_at_255() {
        let mut buf = vec![0u8; HEADER_LEN + 1 + 300 * PARTICIPANT_LEN];
        let len = encode_rsm(&snapshot(300), 1, 0, &mut buf).unwrap();
        assert_eq!(buf[15], 255);
        assert_eq!(len, HEADER_LEN + 1 + 255 * PARTICIPANT_LEN);
    }
}
