//! Mock device implementation for testing without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use image::{ImageFormat, RgbImage};

use crate::control::FOCUS_AUTO;
use crate::convert::yuv_to_rgb;
use crate::error::{CameraError, Result};
use crate::traits::{
    BufferInfo, CameraDevice, ControlDescription, ControlKind, ControlValue, DeviceCapabilities,
    Format, FourCC, IoMethod,
};

#[derive(Debug, Default)]
struct ProbeState {
    buffers: usize,
    stream_on: usize,
    stream_off: usize,
    closed: bool,
    written: Vec<(u32, ControlValue)>,
}

/// Shared view of what a [`MockDevice`] was asked to do.
///
/// Stays readable after the device itself has been moved into a session.
#[derive(Debug, Clone, Default)]
pub struct MockProbe(Rc<RefCell<ProbeState>>);

impl MockProbe {
    /// Driver buffers currently allocated (mapped or user).
    pub fn outstanding_mappings(&self) -> usize {
        self.0.borrow().buffers
    }

    /// Number of stream-on directives issued.
    pub fn stream_on_calls(&self) -> usize {
        self.0.borrow().stream_on
    }

    /// Number of stream-off directives issued.
    pub fn stream_off_calls(&self) -> usize {
        self.0.borrow().stream_off
    }

    /// Whether the device was closed.
    pub fn closed(&self) -> bool {
        self.0.borrow().closed
    }

    /// Controls written so far, in order.
    pub fn written_controls(&self) -> Vec<(u32, ControlValue)> {
        self.0.borrow().written.clone()
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    forced_fourcc: Option<FourCC>,
    forced_size: Option<(u32, u32)>,
    granted_buffers: Option<u32>,
    map_failure_at: Option<usize>,
    stream_on_fails: bool,
    stream_off_fails: bool,
    unreachable: bool,
    pattern: TestPattern,
    scripted: VecDeque<Vec<u8>>,
    controls: Vec<ControlDescription>,
    slots: Vec<Vec<u8>>,
    queued: VecDeque<usize>,
    streaming: bool,
    sequence: u32,
    open: bool,
    probe: MockProbe,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
                can_read: true,
            },
            format: Format::new(64, 48, FourCC::YUYV),
            forced_fourcc: None,
            forced_size: None,
            granted_buffers: None,
            map_failure_at: None,
            stream_on_fails: false,
            stream_off_fails: false,
            unreachable: false,
            pattern: TestPattern::ColorBars,
            scripted: VecDeque::new(),
            controls: default_controls(),
            slots: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            open: true,
            probe: MockProbe::default(),
        }
    }

    /// Handle for observing this device after it is moved.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    /// Report into an existing probe (e.g. across reopen).
    #[must_use]
    pub fn with_probe(mut self, probe: &MockProbe) -> Self {
        self.probe = probe.clone();
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Refuse `read()` i/o.
    #[must_use]
    pub fn without_read_support(mut self) -> Self {
        self.capabilities.can_read = false;
        self
    }

    /// Grant at most `count` driver buffers.
    #[must_use]
    pub const fn with_granted_buffers(mut self, count: u32) -> Self {
        self.granted_buffers = Some(count);
        self
    }

    /// Fail to map buffer `index`.
    #[must_use]
    pub const fn with_map_failure_at(mut self, index: usize) -> Self {
        self.map_failure_at = Some(index);
        self
    }

    /// Refuse stream-on.
    #[must_use]
    pub const fn with_stream_on_failure(mut self) -> Self {
        self.stream_on_fails = true;
        self
    }

    /// Fail stream-off (the queue is still dropped).
    #[must_use]
    pub const fn with_stream_off_failure(mut self) -> Self {
        self.stream_off_fails = true;
        self
    }

    /// Never deliver a frame.
    #[must_use]
    pub const fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Pattern used for generated frames.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Deliver these payloads before falling back to generated frames.
    #[must_use]
    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.scripted = frames.into();
        self
    }

    /// Always answer format negotiation with this fourcc.
    #[must_use]
    pub const fn with_forced_fourcc(mut self, fourcc: FourCC) -> Self {
        self.forced_fourcc = Some(fourcc);
        self
    }

    /// Always answer format negotiation with this resolution.
    #[must_use]
    pub const fn with_forced_size(mut self, width: u32, height: u32) -> Self {
        self.forced_size = Some((width, height));
        self
    }

    fn next_payload(&mut self) -> Vec<u8> {
        self.scripted
            .pop_front()
            .unwrap_or_else(|| generate_test_frame(&self.format, self.pattern))
    }

    fn next_info(&mut self, index: usize, bytes_used: usize) -> BufferInfo {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        BufferInfo {
            index,
            bytes_used,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CameraError::Device("mock device closed".to_owned()))
        }
    }
}

fn default_controls() -> Vec<ControlDescription> {
    vec![
        ControlDescription {
            id: 0x0098_0900,
            name: "Brightness".to_owned(),
            kind: ControlKind::Integer,
            minimum: 0,
            maximum: 255,
            step: 1,
            default: 128,
        },
        ControlDescription {
            id: 0x0098_0918,
            name: "Power Line Frequency".to_owned(),
            kind: ControlKind::Menu(vec![
                (0, "Disabled".to_owned()),
                (1, "50 Hz".to_owned()),
                (2, "60 Hz".to_owned()),
            ]),
            minimum: 0,
            maximum: 2,
            step: 1,
            default: 1,
        },
        ControlDescription {
            id: FOCUS_AUTO,
            name: "Focus, Automatic Continuous".to_owned(),
            kind: ControlKind::Boolean,
            minimum: 0,
            maximum: 1,
            step: 1,
            default: 1,
        },
    ]
}

impl CameraDevice for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        self.ensure_open()?;
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.ensure_open()?;
        let fourcc = self.forced_fourcc.unwrap_or(format.fourcc);
        let (width, height) = self.forced_size.unwrap_or((format.width, format.height));
        let mut granted = Format::new(width, height, fourcc);
        if granted.size == 0 {
            // Compressed: worst case is an uncompressed 4:2:2 frame.
            granted.size = width.saturating_mul(height).saturating_mul(2);
        }
        self.format = granted;
        Ok(self.format.clone())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        self.ensure_open()?;
        Ok(fps)
    }

    fn controls(&self) -> Result<Vec<ControlDescription>> {
        self.ensure_open()?;
        Ok(self.controls.clone())
    }

    fn set_control(&mut self, id: u32, value: ControlValue) -> Result<()> {
        self.ensure_open()?;
        self.probe.0.borrow_mut().written.push((id, value));
        Ok(())
    }

    fn request_buffers(&mut self, method: IoMethod, size: usize, count: u32) -> Result<Vec<usize>> {
        self.ensure_open()?;
        self.release_buffers()?;
        let granted = self.granted_buffers.map_or(count, |limit| limit.min(count)) as usize;
        let length = match method {
            IoMethod::MemoryMapped => self.format.size as usize,
            IoMethod::UserPointer => size,
            IoMethod::Read | IoMethod::Unknown => {
                return Err(CameraError::Buffer(format!(
                    "{method} i/o has no driver buffers"
                )));
            }
        };

        for index in 0..granted {
            if method == IoMethod::MemoryMapped && self.map_failure_at == Some(index) {
                self.release_buffers()?;
                return Err(CameraError::Buffer(format!("mapping buffer {index} failed")));
            }
            self.slots.push(vec![0; length]);
            self.probe.0.borrow_mut().buffers += 1;
        }
        Ok(self.slots.iter().map(Vec::len).collect())
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        self.ensure_open()?;
        if index >= self.slots.len() {
            return Err(CameraError::Buffer(format!("no buffer {index}")));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<BufferInfo> {
        self.ensure_open()?;
        let index = match self.queued.front() {
            Some(&index) if self.streaming && !self.unreachable => index,
            _ => {
                std::thread::sleep(timeout);
                return Err(CameraError::Timeout(timeout));
            }
        };
        self.queued.pop_front();

        let payload = self.next_payload();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| CameraError::Buffer(format!("no buffer {index}")))?;
        let len = payload.len().min(slot.len());
        slot.get_mut(..len)
            .unwrap_or_default()
            .copy_from_slice(payload.get(..len).unwrap_or_default());
        Ok(self.next_info(index, len))
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).map(Vec::as_slice)
    }

    fn read_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        if !self.capabilities.can_read {
            return Err(CameraError::Device("read i/o not supported".to_owned()));
        }
        if self.unreachable {
            std::thread::sleep(timeout);
            return Err(CameraError::Timeout(timeout));
        }
        let payload = self.next_payload();
        let len = payload.len().min(dst.len());
        dst.get_mut(..len)
            .unwrap_or_default()
            .copy_from_slice(payload.get(..len).unwrap_or_default());
        self.sequence = self.sequence.wrapping_add(1);
        Ok(len)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.probe.0.borrow_mut().stream_on += 1;
        if self.stream_on_fails {
            return Err(CameraError::Device("VIDIOC_STREAMON refused".to_owned()));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.probe.0.borrow_mut().stream_off += 1;
        self.streaming = false;
        self.queued.clear();
        if self.stream_off_fails {
            return Err(CameraError::Device("VIDIOC_STREAMOFF refused".to_owned()));
        }
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<()> {
        let mut probe = self.probe.0.borrow_mut();
        probe.buffers = probe.buffers.saturating_sub(self.slots.len());
        self.slots.clear();
        self.queued.clear();
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        // Release never fails for the mock.
        let _ = self.release_buffers();
        self.streaming = false;
        self.open = false;
        self.probe.0.borrow_mut().closed = true;
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pattern sample at column `x` as (Y, U, V).
fn pattern_yuv(pattern: TestPattern, x: u32, width: u32) -> (u8, u8, u8) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];
    let width = width.max(1);
    match pattern {
        TestPattern::ColorBars => {
            let bar = ((x * 8) / width).min(7) as usize;
            BARS.get(bar).copied().unwrap_or((16, 128, 128))
        }
        TestPattern::Gradient => {
            #[allow(clippy::cast_possible_truncation)]
            let y = ((x * 255) / width) as u8;
            (y, 128, 128)
        }
        TestPattern::Solid(y, u, v) => (y, u, v),
    }
}

/// One row of the pattern as packed YUYV.
fn yuyv_row(pattern: TestPattern, width: u32) -> Vec<u8> {
    let mut row = Vec::with_capacity(width as usize * 2);
    for x in (0..width).step_by(2) {
        let (y0, u, v) = pattern_yuv(pattern, x, width);
        let (y1, _, _) = pattern_yuv(pattern, (x + 1).min(width - 1), width);
        row.extend_from_slice(&[y0, u, y1, v]);
    }
    row.truncate(width as usize * 2);
    row
}

/// Generate one frame of `pattern` in the layout `format` describes.
///
/// UYVY frames carry the same samples as YUYV reordered, RGB3 frames the
/// converted colours, GREY frames only the luma and MJPG frames a JPEG.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let row = yuyv_row(pattern, format.width);
    let layout: Vec<u8> = match &format.fourcc.0 {
        b"MJPG" => return encode_jpeg(format.width, format.height, pattern),
        b"UYVY" => row
            .chunks_exact(4)
            .flat_map(|px| {
                let &[y0, u, y1, v] = px else { return [0; 4] };
                [u, y0, v, y1]
            })
            .collect(),
        b"RGB3" => row
            .chunks_exact(4)
            .flat_map(|px| {
                let &[y0, u, y1, v] = px else { return [0; 6] };
                let [r0, g0, b0] = yuv_to_rgb(y0, u, v);
                let [r1, g1, b1] = yuv_to_rgb(y1, u, v);
                [r0, g0, b0, r1, g1, b1]
            })
            .collect(),
        b"GREY" => row.iter().step_by(2).copied().collect(),
        _ => row,
    };

    let stride = (format.stride as usize).max(layout.len());
    let mut data = vec![0u8; stride * format.height as usize];
    for line in data.chunks_exact_mut(stride) {
        if let Some(dst) = line.get_mut(..layout.len()) {
            dst.copy_from_slice(&layout);
        }
    }
    data
}

/// Encode `pattern` as a baseline JPEG of `width` x `height`.
pub fn encode_jpeg(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let rgb = generate_test_frame(&Format::new(width, height, FourCC::RGB3), pattern);
    let image = RgbImage::from_raw(width, height, rgb).expect("pattern sized to image");
    let mut jpeg = Cursor::new(Vec::new());
    image
        .write_to(&mut jpeg, ImageFormat::Jpeg)
        .expect("jpeg encoding failed");
    jpeg.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
        assert!(device.capabilities().can_read);
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new();
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 64);
        assert_eq!(format.height, 48);

        let new_format = Format::new(1280, 720, FourCC::YUYV);
        let actual = device
            .set_format(&new_format)
            .expect("set_format should succeed");
        assert_eq!(actual.width, 1280);
        assert_eq!(actual.height, 720);
    }

    #[test]
    fn test_forced_format() {
        let mut device = MockDevice::new()
            .with_forced_fourcc(FourCC::GREY)
            .with_forced_size(32, 24);
        let actual = device
            .set_format(&Format::new(640, 480, FourCC::YUYV))
            .expect("set_format should succeed");
        assert_eq!(actual, Format::new(32, 24, FourCC::GREY));
    }

    #[test]
    fn test_mock_stream_capture() {
        let mut device = MockDevice::new();
        let size = device.format().expect("format").size as usize;
        let lengths = device
            .request_buffers(IoMethod::MemoryMapped, size, 2)
            .expect("request_buffers should succeed");
        assert_eq!(lengths, vec![size, size]);

        device.queue_buffer(0).expect("queue");
        device.queue_buffer(1).expect("queue");
        device.stream_on().expect("stream_on");

        let first = device
            .dequeue_buffer(Duration::from_millis(10))
            .expect("dequeue should succeed");
        assert_eq!((first.index, first.sequence), (0, 0));
        assert_eq!(first.bytes_used, size);

        let second = device
            .dequeue_buffer(Duration::from_millis(10))
            .expect("dequeue should succeed");
        assert_eq!((second.index, second.sequence), (1, 1));
    }

    #[test]
    fn test_scripted_frames_first() {
        let mut device = MockDevice::new().with_frames(vec![vec![7; 4]]);
        let mut dst = vec![0u8; 16];
        assert_eq!(
            device
                .read_frame(&mut dst, Duration::from_millis(10))
                .expect("read"),
            4
        );
        assert_eq!(dst.first(), Some(&7));
        assert_eq!(
            device
                .read_frame(&mut dst, Duration::from_millis(10))
                .expect("read"),
            16
        );
    }

    #[test]
    fn test_probe_outlives_device() {
        let device = MockDevice::new();
        let probe = device.probe();
        drop(device);
        assert!(probe.closed());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern_layouts() {
        let pattern = TestPattern::Solid(128, 64, 192);
        let yuyv = generate_test_frame(&Format::new(64, 64, FourCC::YUYV), pattern);
        assert_eq!(&yuyv[..4], &[128, 64, 128, 192]);

        let uyvy = generate_test_frame(&Format::new(64, 64, FourCC::UYVY), pattern);
        assert_eq!(&uyvy[..4], &[64, 128, 192, 128]);

        let grey = generate_test_frame(&Format::new(64, 64, FourCC::GREY), pattern);
        assert_eq!(grey.len(), 64 * 64);
        assert!(grey.iter().all(|&y| y == 128));

        let rgb = generate_test_frame(&Format::new(64, 64, FourCC::RGB3), pattern);
        assert_eq!(rgb.len(), 64 * 64 * 3);
    }

    #[test]
    fn test_encode_jpeg_roundtrip_dimensions() {
        let jpeg = encode_jpeg(24, 16, TestPattern::Gradient);
        assert_eq!(jpeg.get(..2), Some(&[0xff, 0xd8][..]));
        let decoded = image::load_from_memory(&jpeg).expect("decodable");
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
    }
}
