//! System configuration.
//!
//! A TOML file with one section per subsystem. Every field has a default,
//! so a partial file (or none at all) yields a runnable configuration; the
//! node treats an unparseable file as fatal outside simulation mode.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FusionError;
use crate::fusion::FusionConfig;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Message queue settings. Capacity is fixed for the process lifetime; a
/// config reload does not resize a live queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Radar adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub device_path: String,
    pub baud_rate: u32,
    pub radar_id: i16,
    pub range_resolution: f64,
    pub angle_resolution: f64,
    pub max_range: f64,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            radar_id: 2,
            range_resolution: 0.1,
            angle_resolution: 1.0,
            max_range: 200.0,
        }
    }
}

/// Video adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub rtsp_url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub camera_id: i16,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            rtsp_url: "rtsp://192.168.1.100:554/stream".into(),
            width: 1920,
            height: 1080,
            fps: 30,
            camera_id: 1,
        }
    }
}

/// V2X broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct V2xConfig {
    /// RSU identifier stamped into every RSM header.
    pub rsu_id: u32,
    /// UDP `host:port` target for encoded frames. `None` logs instead of
    /// transmitting.
    pub target: Option<String>,
}

impl Default for V2xConfig {
    fn default() -> Self {
        Self {
            rsu_id: 1,
            target: None,
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub fusion: FusionConfig,
    pub queue: QueueConfig,
    pub radar: RadarConfig,
    pub video: VideoConfig,
    pub v2x: V2xConfig,
}

impl SystemConfig {
    /// Loads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FusionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FusionError::config(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parses TOML text.
    pub fn parse(raw: &str) -> Result<Self, FusionError> {
        toml::from_str(raw).map_err(|e| FusionError::config(e.to_string()))
    }
}
