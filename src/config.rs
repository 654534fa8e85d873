//! Capture session configuration.

use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{IoMethod, PixelFormat};

/// Configuration for a capture session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    device: String,
    width: u32,
    height: u32,
    fps: u32,
    io_method: IoMethod,
    pixel_format: PixelFormat,
    monochrome: bool,
    buffer_count: u32,
    timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            width: 640,
            height: 480,
            fps: 30,
            io_method: IoMethod::MemoryMapped,
            pixel_format: PixelFormat::Yuyv,
            monochrome: false,
            buffer_count: 4,
            timeout: Duration::from_secs(2),
        }
    }
}

impl DeviceConfig {
    /// Set the device path (e.g., "/dev/video0").
    #[must_use]
    pub fn with_device<S: Into<String>>(mut self, device: S) -> Self {
        self.device = device.into();
        self
    }

    /// Set the capture width in pixels.
    #[must_use]
    pub const fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    /// Set the capture height in pixels.
    #[must_use]
    pub const fn with_height(mut self, height: u32) -> Self {
        self.height = height;
        self
    }

    /// Set the frames per second.
    #[must_use]
    pub const fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the buffer strategy.
    #[must_use]
    pub const fn with_io_method(mut self, io_method: IoMethod) -> Self {
        self.io_method = io_method;
        self
    }

    /// Set the native pixel format requested from the device.
    #[must_use]
    pub const fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Request single-channel grey output instead of RGB.
    #[must_use]
    pub const fn with_monochrome(mut self, monochrome: bool) -> Self {
        self.monochrome = monochrome;
        self
    }

    /// Set how many driver buffers to ask for.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set how long a grab waits for a frame.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Device path.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Requested width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Requested height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Requested frame rate.
    pub const fn fps(&self) -> u32 {
        self.fps
    }

    /// Buffer strategy.
    pub const fn io_method(&self) -> IoMethod {
        self.io_method
    }

    /// Native pixel format.
    pub const fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Whether output is single-channel grey.
    pub const fn monochrome(&self) -> bool {
        self.monochrome
    }

    /// Driver buffers to ask for.
    pub const fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Grab timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reject values no device could serve.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(CameraError::invalid_value("device", "empty path"));
        }
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("fps", self.fps),
            ("buffer_count", self.buffer_count),
        ] {
            if value == 0 {
                return Err(CameraError::invalid_value(name, "must be positive"));
            }
        }
        // Every buffer and the RGB output must fit in u32 bytes.
        if u64::from(self.width) * u64::from(self.height) * 3 > u64::from(u32::MAX) {
            return Err(CameraError::invalid_value(
                "resolution",
                format!("{}x{} exceeds 4 GiB per frame", self.width, self.height),
            ));
        }
        if self.timeout.is_zero() {
            return Err(CameraError::invalid_value("timeout", "must be positive"));
        }
        if self.io_method == IoMethod::Unknown {
            return Err(CameraError::invalid_value("io_method", "unknown io method"));
        }
        if self.pixel_format == PixelFormat::Unknown {
            return Err(CameraError::UnsupportedFormat(
                "unknown pixel format".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.device(), "/dev/video0");
        assert_eq!((config.width(), config.height(), config.fps()), (640, 480, 30));
        assert_eq!(config.io_method(), IoMethod::MemoryMapped);
        assert_eq!(config.pixel_format(), PixelFormat::Yuyv);
        assert!(!config.monochrome());
        assert_eq!(config.buffer_count(), 4);
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::default()
            .with_device("/dev/video2")
            .with_width(1280)
            .with_height(720)
            .with_fps(15)
            .with_io_method(IoMethod::from_name("userptr"))
            .with_pixel_format(PixelFormat::from_name("MJPEG"))
            .with_monochrome(true)
            .with_buffer_count(6)
            .with_timeout(Duration::from_millis(500));

        assert_eq!(config.device(), "/dev/video2");
        assert_eq!((config.width(), config.height(), config.fps()), (1280, 720, 15));
        assert_eq!(config.io_method(), IoMethod::UserPointer);
        assert_eq!(config.pixel_format(), PixelFormat::Mjpeg);
        assert!(config.monochrome());
        assert_eq!(config.buffer_count(), 6);
        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_zero_dimensions() {
        let err = DeviceConfig::default()
            .with_height(0)
            .validate()
            .expect_err("zero height should fail");
        assert!(matches!(err, CameraError::InvalidValue { name, .. } if name == "height"));

        assert!(DeviceConfig::default().with_fps(0).validate().is_err());
        assert!(DeviceConfig::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_resolution() {
        let err = DeviceConfig::default()
            .with_width(70_000)
            .with_height(70_000)
            .validate()
            .expect_err("70000x70000 should fail");
        assert!(matches!(err, CameraError::InvalidValue { name, .. } if name == "resolution"));

        assert!(DeviceConfig::default()
            .with_width(7680)
            .with_height(4320)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_sentinels() {
        let err = DeviceConfig::default()
            .with_pixel_format(PixelFormat::from_name("bayer"))
            .validate()
            .expect_err("unknown format should fail");
        assert!(matches!(err, CameraError::UnsupportedFormat(_)));

        let err = DeviceConfig::default()
            .with_io_method(IoMethod::from_name("dmabuf"))
            .validate()
            .expect_err("unknown io method should fail");
        assert!(matches!(err, CameraError::InvalidValue { .. }));
    }
}
