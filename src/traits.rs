//! Core types and the device seam shared by the capture pipeline.

use std::fmt;
use std::time::Duration;

use crate::error::{CameraError, Result};

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// GREY pixel format (8-bit luma).
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for packed formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" | b"UYVY" => Some(2),
            b"RGB3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    ///
    /// Stride and size are derived for packed formats and left at zero for
    /// compressed ones, where only the driver knows the worst-case size.
    /// Sizes past `u32::MAX` saturate; use [`Format::sanitized`] to reject them.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc.bytes_per_pixel() {
            Some(bpp) => width.saturating_mul(bpp),
            None => 0,
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size: stride.saturating_mul(height),
        }
    }

    /// Raise stride and size to the minimum the pixel layout needs.
    ///
    /// Some drivers report a zero or short `bytesperline`/`sizeimage`.
    /// Fails when a frame of this shape does not fit in `u32` bytes.
    pub fn sanitized(mut self) -> Result<Self> {
        if let Some(bpp) = self.fourcc.bytes_per_pixel() {
            let stride = self
                .width
                .checked_mul(bpp)
                .ok_or_else(|| self.oversized())?;
            self.stride = self.stride.max(stride);
            let size = self
                .stride
                .checked_mul(self.height)
                .ok_or_else(|| self.oversized())?;
            self.size = self.size.max(size);
        }
        Ok(self)
    }

    fn oversized(&self) -> CameraError {
        CameraError::invalid_value(
            "resolution",
            format!("{}x{} {} frame exceeds 4 GiB", self.width, self.height, self.fourcc),
        )
    }
}

/// Native pixel layout streamed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2, `Y0 U Y1 V`.
    Yuyv,
    /// Packed 4:2:2, `U Y0 V Y1`.
    Uyvy,
    /// Motion JPEG.
    Mjpeg,
    /// 10-bit mono samples in 16-bit little-endian words.
    YuvMono10,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit luma.
    Grey,
    /// Unrecognised name; rejected at `start`.
    Unknown,
}

impl PixelFormat {
    /// Parse a case-insensitive format name; unknown names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "yuyv" => Self::Yuyv,
            "uyvy" => Self::Uyvy,
            "mjpeg" => Self::Mjpeg,
            "yuvmono10" | "yuv-mono10" => Self::YuvMono10,
            "rgb24" => Self::Rgb24,
            "grey" => Self::Grey,
            _ => Self::Unknown,
        }
    }

    /// The fourcc requested from the driver for this layout.
    pub const fn fourcc(self) -> Option<FourCC> {
        match self {
            // Mono10 cameras advertise their 16-bit words as YUYV.
            Self::Yuyv | Self::YuvMono10 => Some(FourCC::YUYV),
            Self::Uyvy => Some(FourCC::UYVY),
            Self::Mjpeg => Some(FourCC::MJPG),
            Self::Rgb24 => Some(FourCC::RGB3),
            Self::Grey => Some(FourCC::GREY),
            Self::Unknown => None,
        }
    }

    /// Whether frames must pass through the frame decoder.
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Mjpeg)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yuyv => "yuyv",
            Self::Uyvy => "uyvy",
            Self::Mjpeg => "mjpeg",
            Self::YuvMono10 => "yuvmono10",
            Self::Rgb24 => "rgb24",
            Self::Grey => "grey",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Buffer acquisition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoMethod {
    /// `read()` into one process-owned scratch buffer.
    Read,
    /// Driver buffers mapped into the process.
    MemoryMapped,
    /// Process buffers whose addresses are handed to the driver.
    UserPointer,
    /// Unrecognised name; rejected at `start`.
    Unknown,
}

impl IoMethod {
    /// Parse a case-insensitive method name; unknown names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "read" => Self::Read,
            "mmap" => Self::MemoryMapped,
            "userptr" => Self::UserPointer,
            _ => Self::Unknown,
        }
    }

    /// Whether buffers cycle through the driver queue.
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::MemoryMapped | Self::UserPointer)
    }
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::MemoryMapped => "mmap",
            Self::UserPointer => "userptr",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O (mmap, userptr).
    pub can_stream: bool,
    /// Whether the device supports `read()` I/O.
    pub can_read: bool,
}

impl DeviceCapabilities {
    /// Whether the device can serve the given buffer strategy.
    pub const fn supports(&self, method: IoMethod) -> bool {
        match method {
            IoMethod::Read => self.can_read,
            IoMethod::MemoryMapped | IoMethod::UserPointer => self.can_stream,
            IoMethod::Unknown => false,
        }
    }
}

/// Metadata for a buffer handed back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Slot index in the driver queue.
    pub index: usize,
    /// Valid bytes in the buffer.
    pub bytes_used: usize,
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// Value written to (or requested for) a device control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    /// Integer, menu index or integer-menu index.
    Integer(i64),
    /// Boolean toggle.
    Boolean(bool),
    /// Free text, or a menu item name before resolution.
    String(String),
}

impl From<i64> for ControlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for ControlValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for ControlValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for ControlValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Type of a device control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// 32- or 64-bit integer.
    Integer,
    /// On/off.
    Boolean,
    /// Menu of named items, keyed by index.
    Menu(Vec<(u32, String)>),
    /// Menu of integer items, keyed by index.
    IntegerMenu(Vec<(u32, i64)>),
    /// Text.
    String,
    /// Write-only trigger.
    Button,
    /// Anything the pipeline does not write (classes, compound types).
    Other,
}

/// A control advertised by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescription {
    /// Control id.
    pub id: u32,
    /// Human readable name as reported by the driver.
    pub name: String,
    /// Control type.
    pub kind: ControlKind,
    /// Minimum value (minimum length for strings).
    pub minimum: i64,
    /// Maximum value (maximum length for strings).
    pub maximum: i64,
    /// Step between valid values.
    pub step: u64,
    /// Default value.
    pub default: i64,
}

/// Abstraction over a capture device and its kernel buffer queue.
///
/// Memory for `MemoryMapped` and `UserPointer` slots lives with the
/// implementation; `BufferPool` decides when a slot may be read or requeued.
pub trait CameraDevice {
    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Request a frame rate. Returns the rate the driver granted.
    fn set_frame_rate(&mut self, fps: u32) -> Result<u32>;

    /// Enumerate the device's controls.
    fn controls(&self) -> Result<Vec<ControlDescription>>;

    /// Write a control by id.
    fn set_control(&mut self, id: u32, value: ControlValue) -> Result<()>;

    /// Reserve driver buffers for a streaming method.
    ///
    /// Returns the length of every slot the driver agreed to provide. A
    /// failure leaves no slot mapped or requested.
    fn request_buffers(&mut self, method: IoMethod, size: usize, count: u32) -> Result<Vec<usize>>;

    /// Hand slot `index` to the driver's input queue.
    fn queue_buffer(&mut self, index: usize) -> Result<()>;

    /// Wait up to `timeout` for the driver to fill a slot.
    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<BufferInfo>;

    /// Contents of slot `index`.
    fn buffer(&self, index: usize) -> Option<&[u8]>;

    /// Read one frame into `dst` (`Read` method). Returns bytes read.
    fn read_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming; the driver gives every queued slot back.
    fn stream_off(&mut self) -> Result<()>;

    /// Unmap and free every slot. Safe to call with nothing allocated.
    fn release_buffers(&mut self) -> Result<()>;

    /// Close the device handle. Idempotent.
    fn close(&mut self);

    /// Write a control by its `v4l2-ctl` style name.
    fn set_named_control(&mut self, name: &str, value: ControlValue) -> Result<()> {
        let controls = self.controls()?;
        let (id, value) = crate::control::resolve(&controls, name, value)?;
        self.set_control(id, value)
    }
}
