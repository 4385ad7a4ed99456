//! RoadFusion Core - MEC roadside perception fusion engine.
//!
//! Heterogeneous roadside sensors (cameras, millimetre-wave radars) report
//! target detections asynchronously; this library associates them into
//! globally-identified fused tracks, predicts motion between measurements,
//! and serializes the fused picture into V2X Roadside-Safety-Message frames
//! for broadcast.
//!
//! The pipeline, producer to consumer:
//! 1. Sensor adapters collect detections into a shared [`DetectionBatch`]
//!    and push it through the bounded [`MessageQueue`].
//! 2. The [`FusionEngine`] (driven by a [`FusionWorker`] thread) gates and
//!    associates detections, maintains per-track Kalman state, and
//!    publishes a fused snapshot every cycle.
//! 3. [`v2x::encode_rsm`] turns a snapshot into the on-wire RSM frame.

pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod fusion;
pub mod kalman;
pub mod metrics;
pub mod queue;
pub mod radar;
pub mod v2x;

// Re-export key types for convenience
pub use camera::PerspectiveTransform;
pub use config::SystemConfig;
pub use detection::{
    now_micros, BatchRef, Detection, DetectionBatch, GeoPosition, TargetType, FUSED_SENSOR_ID,
};
pub use error::FusionError;
pub use fusion::{EngineStats, FusedTrack, FusionConfig, FusionEngine, FusionWorker, CYCLE_PERIOD};
pub use kalman::FilterState;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use queue::{MessageQueue, PopTimeout, SensorMessage, DEFAULT_QUEUE_CAPACITY};
pub use radar::{RadarDetection, RadarFrameParser, RADAR_FRAME_LEN};
