//! Compressed frame decoding.
//!
//! A [`FrameDecoder`] owns a stream decoder and the planar frame it decodes
//! into. Each call feeds one captured buffer and returns at most one frame.

use image::{DynamicImage, ImageFormat};
use log::trace;

use crate::error::{CameraError, Result};
use crate::traits::PixelFormat;

/// A decoded frame as separate luma and chroma planes.
///
/// Planes are full resolution (4:4:4) and full range. Greyscale sources
/// carry empty chroma planes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanarFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Luma plane, `width * height` bytes.
    pub y: Vec<u8>,
    /// Blue-difference plane, `width * height` bytes or empty.
    pub cb: Vec<u8>,
    /// Red-difference plane, `width * height` bytes or empty.
    pub cr: Vec<u8>,
}

impl PlanarFrame {
    /// Whether the frame has chroma planes.
    pub fn has_chroma(&self) -> bool {
        !self.cb.is_empty() && !self.cr.is_empty()
    }

    fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Packet-in, frame-out decoder with internal state across calls.
pub trait StreamDecoder {
    /// Feed compressed input. Returns how many bytes were consumed.
    fn send_packet(&mut self, packet: &[u8]) -> Result<usize>;

    /// Move a finished frame into `frame`. `Ok(false)` means more input is
    /// needed.
    fn receive_frame(&mut self, frame: &mut PlanarFrame) -> Result<bool>;
}

/// Motion-JPEG stream decoder. Every packet is a complete picture.
#[derive(Debug, Default)]
pub struct MjpegDecoder {
    ready: Option<DynamicImage>,
}

impl MjpegDecoder {
    /// Create an idle decoder.
    pub const fn new() -> Self {
        Self { ready: None }
    }
}

impl StreamDecoder for MjpegDecoder {
    fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
        self.ready = None;
        let picture = image::load_from_memory_with_format(packet, ImageFormat::Jpeg)
            .map_err(|err| CameraError::Decode(err.to_string()))?;
        self.ready = Some(picture);
        Ok(packet.len())
    }

    fn receive_frame(&mut self, frame: &mut PlanarFrame) -> Result<bool> {
        let Some(picture) = self.ready.take() else {
            return Ok(false);
        };

        frame.width = picture.width();
        frame.height = picture.height();
        if let DynamicImage::ImageLuma8(luma) = picture {
            frame.y = luma.into_raw();
            frame.cb.clear();
            frame.cr.clear();
            return Ok(true);
        }

        // `image` only hands out RGB for colour JPEGs, so chroma is derived
        // back from it. The round trip stays within a couple of codes.
        let rgb = picture.into_rgb8();
        let count = frame.pixel_count();
        frame.y.resize(count, 0);
        frame.cb.resize(count, 0);
        frame.cr.resize(count, 0);
        let planes = frame
            .y
            .iter_mut()
            .zip(frame.cb.iter_mut())
            .zip(frame.cr.iter_mut());
        for (((y, cb), cr), px) in planes.zip(rgb.pixels()) {
            let [r, g, b] = px.0;
            let [luma, blue, red] = rgb_to_ycbcr(r, g, b);
            *y = luma;
            *cb = blue;
            *cr = red;
        }
        Ok(true)
    }
}

/// Full-range (JFIF) RGB to Y/Cb/Cr, 16-bit fixed point.
#[allow(clippy::many_single_char_names, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = (19_595 * r + 38_470 * g + 7_471 * b + 32_768) >> 16;
    let cb = ((-11_059 * r - 21_709 * g + 32_768 * b + 32_768) >> 16) + 128;
    let cr = ((32_768 * r - 27_439 * g - 5_329 * b + 32_768) >> 16) + 128;
    [
        y.clamp(0, 255) as u8,
        cb.clamp(0, 255) as u8,
        cr.clamp(0, 255) as u8,
    ]
}

/// Decoder context for one compressed session.
pub struct FrameDecoder {
    codec: Box<dyn StreamDecoder>,
    frame: PlanarFrame,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("codec", &"<dyn StreamDecoder>")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl FrameDecoder {
    /// Decoder for `format` producing `width` x `height` frames.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let codec: Box<dyn StreamDecoder> = match format {
            PixelFormat::Mjpeg => Box::new(MjpegDecoder::new()),
            other => {
                return Err(CameraError::UnsupportedFormat(format!(
                    "{other} is not a compressed format"
                )));
            }
        };
        Ok(Self::with_codec(codec, width, height))
    }

    /// Decoder around an arbitrary stream decoder.
    pub fn with_codec(codec: Box<dyn StreamDecoder>, width: u32, height: u32) -> Self {
        let count = width as usize * height as usize;
        Self {
            codec,
            frame: PlanarFrame {
                width,
                height,
                y: Vec::with_capacity(count),
                cb: Vec::with_capacity(count),
                cr: Vec::with_capacity(count),
            },
            width,
            height,
        }
    }

    /// Decode one captured buffer.
    ///
    /// Drains a frame if the codec already holds one, otherwise feeds the
    /// packet until a frame comes out or the packet is used up.
    pub fn decode(&mut self, packet: &[u8]) -> Result<&PlanarFrame> {
        let mut remaining = packet;
        loop {
            if self.codec.receive_frame(&mut self.frame)? {
                break;
            }
            if remaining.is_empty() {
                return Err(CameraError::Decode(format!(
                    "no picture after {} byte packet",
                    packet.len()
                )));
            }
            let used = self.codec.send_packet(remaining)?;
            if used == 0 {
                return Err(CameraError::Decode("decoder consumed no input".to_owned()));
            }
            remaining = remaining.get(used..).unwrap_or_default();
        }

        if (self.frame.width, self.frame.height) != (self.width, self.height) {
            return Err(CameraError::Decode(format!(
                "decoded {}x{}, expected {}x{}",
                self.frame.width, self.frame.height, self.width, self.height
            )));
        }
        trace!("decoded {} byte packet", packet.len());
        Ok(&self.frame)
    }
}
