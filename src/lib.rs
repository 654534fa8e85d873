//! V4L2 frame grabbing with per-format conversion to RGB or grey.
//!
//! A [`CaptureSession`] opens a capture device, negotiates a native pixel
//! format, allocates driver buffers (`read()`, memory-mapped or user
//! pointer), and converts every grabbed frame into a caller-owned
//! [`OutputImage`]. Motion-JPEG frames are decoded on the way.
//!
//! Device access sits behind the [`CameraDevice`] trait, enabling both
//! production use with real hardware and testing with mock devices.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod control;
pub mod convert;
pub mod decoder;
pub mod device;
pub mod error;
pub mod output;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use capture::SessionState;
pub use config::DeviceConfig;
pub use convert::ConversionRoutine;
pub use device::V4L2Device;
pub use error::{CameraError, Result};
pub use output::{Encoding, OutputImage};
pub use session::CaptureSession;
pub use traits::{
    CameraDevice, ControlValue, DeviceCapabilities, Format, FourCC, IoMethod, PixelFormat,
};
