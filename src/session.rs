//! Capture session facade.
//!
//! A [`CaptureSession`] ties the device, buffer pool, converter and
//! lifecycle together. Everything acquired by `start` lives in one scoped
//! value whose drop stops streaming, releases buffers and closes the
//! device, so every exit path (failed start, shutdown, session drop)
//! unwinds the same way.

use std::fmt;

use log::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::capture::{CaptureState, SessionState};
use crate::config::DeviceConfig;
use crate::control::FOCUS_AUTO;
use crate::convert::{ConversionRoutine, FormatConverter};
use crate::device::V4L2Device;
use crate::error::{CameraError, Result};
use crate::output::OutputImage;
use crate::traits::{CameraDevice, ControlValue, Format, FourCC};

/// Opens a device by path.
pub type DeviceOpener<D> = Box<dyn FnMut(&str) -> Result<D>>;

/// Negotiated format, buffers and converter of a configured device.
#[derive(Debug)]
struct Stream {
    format: Format,
    pool: BufferPool,
    converter: FormatConverter,
}

/// Everything a started session owns.
struct Active<D: CameraDevice> {
    device: D,
    capture: CaptureState,
    stream: Option<Stream>,
    config: DeviceConfig,
}

impl<D: CameraDevice> Active<D> {
    /// Negotiate the format, build the converter and allocate buffers.
    fn configure(&mut self, routine: ConversionRoutine) -> Result<()> {
        let config = &self.config;
        let fourcc = config.pixel_format().fourcc().ok_or_else(|| {
            CameraError::UnsupportedFormat(format!("{} has no fourcc", config.pixel_format()))
        })?;

        let requested = Format::new(config.width(), config.height(), fourcc);
        let granted = self.device.set_format(&requested)?;
        if granted.fourcc != fourcc {
            return Err(CameraError::UnsupportedFormat(format!(
                "requested {fourcc}, device granted {}",
                granted.fourcc
            )));
        }
        if (granted.width, granted.height) != (requested.width, requested.height) {
            warn!(
                "device granted {}x{} instead of {}x{}",
                granted.width, granted.height, requested.width, requested.height
            );
        }
        let mut format = granted.sanitized()?;
        if format.size == 0 {
            // Compressed formats without a driver size hint: room for 4:2:2.
            format.size = Format::new(format.width, format.height, FourCC::YUYV)
                .sanitized()?
                .size;
        }

        match self.device.set_frame_rate(config.fps()) {
            Ok(fps) if fps != config.fps() => {
                warn!("requested {} fps, device runs at {fps}", config.fps());
            }
            Ok(_) => {}
            Err(err) => warn!("setting {} fps failed: {err}", config.fps()),
        }

        let converter = FormatConverter::new(routine, format.width, format.height)?;
        let pool = BufferPool::allocate(
            &mut self.device,
            config.io_method(),
            format.size as usize,
            config.buffer_count(),
        )?;
        self.stream = Some(Stream {
            format,
            pool,
            converter,
        });
        self.capture.mark_configured()
    }

    fn start_capturing(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(CameraError::InvalidState(self.capture.state()))?;
        self.capture
            .start_capturing(&mut self.device, &mut stream.pool)
    }

    fn stop_capturing(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            self.capture.stop_capturing(&mut self.device, &mut stream.pool);
        }
    }

    fn grab(&mut self, image: &mut OutputImage) -> Result<()> {
        if !self.capture.is_capturing() {
            return Err(CameraError::InvalidState(self.capture.state()));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(CameraError::InvalidState(self.capture.state()))?;

        let buffer = stream
            .pool
            .dequeue_one(&mut self.device, self.config.timeout())?;

        let converted = match stream.pool.frame(&self.device, &buffer) {
            Ok(src) => {
                image.reshape(
                    stream.format.width,
                    stream.format.height,
                    stream.converter.encoding(),
                );
                stream.converter.convert(src, &mut image.data)
            }
            Err(err) => Err(err),
        };
        image.sequence = buffer.sequence();
        image.timestamp = buffer.timestamp();

        // The slot goes back to the driver even when conversion failed.
        let requeued = stream.pool.requeue(&mut self.device, buffer);
        converted?;
        requeued
    }
}

impl<D: CameraDevice> Drop for Active<D> {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.capture
                .stop_capturing(&mut self.device, &mut stream.pool);
            stream.pool.release(&mut self.device);
        }
        self.device.close();
        self.capture.mark_closed();
    }
}

/// A capture session: configure once, then grab converted frames.
pub struct CaptureSession<D: CameraDevice = V4L2Device> {
    opener: DeviceOpener<D>,
    active: Option<Active<D>>,
}

impl<D: CameraDevice> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state())
            .field("format", &self.format())
            .finish_non_exhaustive()
    }
}

impl Default for CaptureSession<V4L2Device> {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession<V4L2Device> {
    /// A closed session over real V4L2 devices.
    pub fn new() -> Self {
        Self::with_opener(V4L2Device::open)
    }
}

impl<D: CameraDevice> CaptureSession<D> {
    /// A closed session that opens devices with `opener`.
    pub fn with_opener<F>(opener: F) -> Self
    where
        F: FnMut(&str) -> Result<D> + 'static,
    {
        Self {
            opener: Box::new(opener),
            active: None,
        }
    }

    /// Open, configure and start streaming.
    ///
    /// The conversion routine is picked before the device is opened, so an
    /// unsupported format/output pair fails without touching hardware. Any
    /// later failure closes the device and releases its buffers.
    pub fn start(&mut self, config: DeviceConfig) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(CameraError::InvalidState(active.capture.state()));
        }
        config.validate()?;
        let routine = ConversionRoutine::select(config.pixel_format(), config.monochrome())?;

        let device = (self.opener)(config.device())?;
        let mut active = Active {
            device,
            capture: CaptureState::new(),
            stream: None,
            config,
        };
        active.capture.mark_opened()?;
        active.configure(routine)?;
        active.start_capturing()?;

        if let Some(stream) = &active.stream {
            info!(
                "{}: {}x{} {} via {:?}, {} {} buffers",
                active.config.device(),
                stream.format.width,
                stream.format.height,
                stream.format.fourcc,
                routine,
                stream.pool.len(),
                stream.pool.method()
            );
        }
        self.active = Some(active);
        Ok(())
    }

    /// Capture one frame into `image`.
    ///
    /// `image` is resized to the granted resolution and the routine's
    /// encoding. Timeouts, decode failures and short frames leave the
    /// session streaming; see [`CameraError::is_recoverable`].
    pub fn grab(&mut self, image: &mut OutputImage) -> Result<()> {
        self.active
            .as_mut()
            .ok_or(CameraError::InvalidState(SessionState::Closed))?
            .grab(image)
    }

    /// Stop streaming, release buffers and close the device. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            let device = active.config.device().to_owned();
            drop(active);
            debug!("{device}: session shut down");
        }
    }

    /// Resume streaming after [`stop_capturing`](Self::stop_capturing).
    pub fn start_capturing(&mut self) -> Result<()> {
        self.active
            .as_mut()
            .ok_or(CameraError::InvalidState(SessionState::Closed))?
            .start_capturing()
    }

    /// Pause streaming, keeping format and buffers.
    pub fn stop_capturing(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.stop_capturing();
        }
    }

    /// Whether frames are being produced.
    pub fn is_capturing(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.capture.is_capturing())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map_or(SessionState::Closed, |active| active.capture.state())
    }

    /// Number of buffers in the pool, zero when closed.
    pub fn buffer_count(&self) -> usize {
        self.stream().map_or(0, |stream| stream.pool.len())
    }

    /// Format granted by the device.
    pub fn format(&self) -> Option<&Format> {
        self.stream().map(|stream| &stream.format)
    }

    /// Configuration the session was started with.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.active.as_ref().map(|active| &active.config)
    }

    /// The open device.
    pub fn device(&self) -> Option<&D> {
        self.active.as_ref().map(|active| &active.device)
    }

    /// Write a named device control (`brightness`, `power_line_frequency`).
    pub fn set_parameter<V: Into<ControlValue>>(&mut self, name: &str, value: V) -> Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or(CameraError::InvalidState(SessionState::Closed))?;
        active.device.set_named_control(name, value.into())
    }

    /// Switch continuous autofocus on or off.
    pub fn set_auto_focus(&mut self, enabled: bool) -> Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or(CameraError::InvalidState(SessionState::Closed))?;
        if !active
            .device
            .controls()?
            .iter()
            .any(|control| control.id == FOCUS_AUTO)
        {
            return Err(CameraError::UnsupportedControl("focus_auto".to_owned()));
        }
        active
            .device
            .set_control(FOCUS_AUTO, ControlValue::Boolean(enabled))
    }

    fn stream(&self) -> Option<&Stream> {
        self.active.as_ref().and_then(|active| active.stream.as_ref())
    }
}
