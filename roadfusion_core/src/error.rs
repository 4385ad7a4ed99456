//! Error types for the fusion pipeline.

use thiserror::Error;

/// Errors that can occur anywhere in the fusion pipeline.
///
/// Most of these are flow-control signals rather than failures: `QueueFull`
/// tells a producer to drop and continue, `QueueTimeout` is the normal idle
/// path of the consumer loop. Only configuration errors are treated as fatal
/// by the node binary.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Queue is at capacity; the message was not enqueued.
    #[error("message queue is full")]
    QueueFull,

    /// No message arrived within the pop timeout.
    #[error("message queue pop timed out")]
    QueueTimeout,

    /// Queue has been closed for shutdown.
    #[error("message queue is closed")]
    QueueClosed,

    /// Output buffer cannot hold the encoded frame.
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Detection carries NaN or out-of-range fields.
    #[error("invalid detection: {0}")]
    InvalidDetection(&'static str),

    /// Track table is at capacity; the detection that would birth a track
    /// is dropped.
    #[error("fused track table is full")]
    TrackTableFull,

    /// Camera transform has not been calibrated.
    #[error("perspective transform is not calibrated")]
    NotCalibrated,

    /// Homography denominator collapsed to ~0 for this pixel.
    #[error("degenerate projection")]
    DegenerateProjection,

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl FusionError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
