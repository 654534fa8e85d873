//! Error type shared by every stage of the capture pipeline.

use std::time::Duration;

use crate::capture::SessionState;

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Open, ioctl or control failure reported by the device.
    #[error("device error: {0}")]
    Device(String),
    /// Buffer allocation, mapping or ownership failure.
    #[error("buffer error: {0}")]
    Buffer(String),
    /// No frame arrived within the bound.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// Malformed compressed frame.
    #[error("decode error: {0}")]
    Decode(String),
    /// Pixel format or conversion pair that cannot be served.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Control name unknown to the device.
    #[error("unsupported control: {0}")]
    UnsupportedControl(String),
    /// Parameter or control value out of range.
    #[error("invalid value for {name}: {reason}")]
    InvalidValue {
        /// Parameter or control name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// A dequeued frame is shorter than the active format requires.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame {
        /// Bytes the conversion routine needs.
        expected: usize,
        /// Bytes the driver delivered.
        actual: usize,
    },
    /// Operation not allowed in the current lifecycle state.
    #[error("operation not allowed while {0}")]
    InvalidState(SessionState),
}

impl CameraError {
    /// Per-frame failures that leave the session streaming.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Decode(_) | Self::IncompleteFrame { .. }
        )
    }

    pub(crate) fn invalid_value<R: Into<String>>(name: &str, reason: R) -> Self {
        Self::InvalidValue {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
