//! Pixel format conversion.
//!
//! The routine is picked once from (native format, monochrome flag) when a
//! session is configured and then applied to every frame.

use crate::decoder::{FrameDecoder, PlanarFrame};
use crate::error::{CameraError, Result};
use crate::output::Encoding;
use crate::traits::PixelFormat;

/// A conversion from a native layout to an output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionRoutine {
    /// YUYV 4:2:2 to RGB.
    YuyvToRgb,
    /// YUYV luma only.
    YuyvToGrey,
    /// UYVY 4:2:2 to RGB.
    UyvyToRgb,
    /// UYVY luma only.
    UyvyToGrey,
    /// Decoded Motion-JPEG to RGB.
    MjpegToRgb,
    /// Decoded Motion-JPEG luma plane.
    MjpegToGrey,
    /// 10-bit mono words to 8-bit grey.
    Mono10ToGrey,
    /// RGB copy.
    RgbToRgb,
    /// Grey copy.
    GreyToGrey,
}

impl ConversionRoutine {
    /// Pick the routine for a native format and output flavour.
    pub fn select(native: PixelFormat, monochrome: bool) -> Result<Self> {
        let routine = match (native, monochrome) {
            (PixelFormat::Yuyv, false) => Self::YuyvToRgb,
            (PixelFormat::Yuyv, true) => Self::YuyvToGrey,
            (PixelFormat::Uyvy, false) => Self::UyvyToRgb,
            (PixelFormat::Uyvy, true) => Self::UyvyToGrey,
            (PixelFormat::Mjpeg, false) => Self::MjpegToRgb,
            (PixelFormat::Mjpeg, true) => Self::MjpegToGrey,
            (PixelFormat::YuvMono10, true) => Self::Mono10ToGrey,
            (PixelFormat::Rgb24, false) => Self::RgbToRgb,
            (PixelFormat::Grey, true) => Self::GreyToGrey,
            (native, monochrome) => {
                let output = if monochrome { "mono8" } else { "rgb8" };
                return Err(CameraError::UnsupportedFormat(format!(
                    "no conversion from {native} to {output}"
                )));
            }
        };
        Ok(routine)
    }

    /// Encoding the routine produces.
    pub const fn encoding(self) -> Encoding {
        match self {
            Self::YuyvToRgb | Self::UyvyToRgb | Self::MjpegToRgb | Self::RgbToRgb => Encoding::Rgb8,
            Self::YuyvToGrey
            | Self::UyvyToGrey
            | Self::MjpegToGrey
            | Self::Mono10ToGrey
            | Self::GreyToGrey => Encoding::Mono8,
        }
    }

    /// Whether the source must be decoded first.
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::MjpegToRgb | Self::MjpegToGrey)
    }

    /// Bytes per source pixel, `None` for compressed sources.
    pub const fn source_bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::YuyvToRgb
            | Self::YuyvToGrey
            | Self::UyvyToRgb
            | Self::UyvyToGrey
            | Self::Mono10ToGrey => Some(2),
            Self::RgbToRgb => Some(3),
            Self::GreyToGrey => Some(1),
            Self::MjpegToRgb | Self::MjpegToGrey => None,
        }
    }

    /// Convert a packed source frame. `dst` must hold exactly one output
    /// frame; `src` at least one source frame.
    pub fn convert_packed(self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let bpp = self.encoding().bytes_per_pixel();
        let pixels = dst.len() / bpp;
        let expected = self
            .source_bytes_per_pixel()
            .map(|src_bpp| pixels * src_bpp)
            .ok_or_else(|| {
                CameraError::UnsupportedFormat("compressed source needs a decoder".to_owned())
            })?;
        let src = src.get(..expected).ok_or(CameraError::IncompleteFrame {
            expected,
            actual: src.len(),
        })?;

        match self {
            Self::YuyvToRgb => yuyv_to_rgb(src, dst),
            Self::YuyvToGrey => luma_every_other(src, dst, 0),
            Self::UyvyToRgb => uyvy_to_rgb(src, dst),
            Self::UyvyToGrey => luma_every_other(src, dst, 1),
            Self::Mono10ToGrey => mono10_to_grey(src, dst),
            Self::RgbToRgb | Self::GreyToGrey => dst.copy_from_slice(src),
            Self::MjpegToRgb | Self::MjpegToGrey => {}
        }
        Ok(())
    }

    /// Convert a decoded planar frame.
    pub fn convert_planar(self, frame: &PlanarFrame, dst: &mut [u8]) -> Result<()> {
        let pixels = frame.width as usize * frame.height as usize;
        if frame.y.len() < pixels {
            return Err(CameraError::IncompleteFrame {
                expected: pixels,
                actual: frame.y.len(),
            });
        }
        match self {
            Self::MjpegToGrey => {
                let luma = frame.y.get(..dst.len()).ok_or(CameraError::IncompleteFrame {
                    expected: dst.len(),
                    actual: frame.y.len(),
                })?;
                dst.copy_from_slice(luma);
            }
            Self::MjpegToRgb if frame.has_chroma() => {
                let planes = frame.y.iter().zip(&frame.cb).zip(&frame.cr);
                for (((&y, &cb), &cr), px) in planes.zip(dst.chunks_exact_mut(3)) {
                    px.copy_from_slice(&yuv_to_rgb(y, cb, cr));
                }
            }
            Self::MjpegToRgb => {
                for (&y, px) in frame.y.iter().zip(dst.chunks_exact_mut(3)) {
                    px.fill(y);
                }
            }
            other => {
                return Err(CameraError::UnsupportedFormat(format!(
                    "{other:?} does not take planar frames"
                )));
            }
        }
        Ok(())
    }
}

/// Convert one Y/Cb/Cr sample to RGB.
///
/// ITU-R BT.601 full-range matrix in 16-bit fixed point.
#[must_use]
#[allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;

    let r = y + ((91_881 * v) >> 16);
    let g = y - ((22_554 * u + 46_802 * v) >> 16);
    let b = y + ((116_130 * u) >> 16);

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

fn yuyv_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (yuyv, rgb) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        let &[y0, u, y1, v] = yuyv else { continue };
        let (first, second) = rgb.split_at_mut(3);
        first.copy_from_slice(&yuv_to_rgb(y0, u, v));
        second.copy_from_slice(&yuv_to_rgb(y1, u, v));
    }
}

fn uyvy_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (uyvy, rgb) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        let &[u, y0, v, y1] = uyvy else { continue };
        let (first, second) = rgb.split_at_mut(3);
        first.copy_from_slice(&yuv_to_rgb(y0, u, v));
        second.copy_from_slice(&yuv_to_rgb(y1, u, v));
    }
}

/// Take the luma byte at `offset` of every 2-byte 4:2:2 sample.
fn luma_every_other(src: &[u8], dst: &mut [u8], offset: usize) {
    for (sample, grey) in src.chunks_exact(2).zip(dst.iter_mut()) {
        if let Some(&luma) = sample.get(offset) {
            *grey = luma;
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn mono10_to_grey(src: &[u8], dst: &mut [u8]) {
    for (word, grey) in src.chunks_exact(2).zip(dst.iter_mut()) {
        let &[lo, hi] = word else { continue };
        *grey = ((u16::from_le_bytes([lo, hi]) & 0x03ff) >> 2) as u8;
    }
}

/// Applies the session's routine, decoding first when the source is
/// compressed.
#[derive(Debug)]
pub struct FormatConverter {
    routine: ConversionRoutine,
    width: u32,
    height: u32,
    decoder: Option<FrameDecoder>,
}

impl FormatConverter {
    /// Converter for `width` x `height` frames. Creates the decoder context
    /// for compressed routines.
    pub fn new(routine: ConversionRoutine, width: u32, height: u32) -> Result<Self> {
        let decoder = if routine.is_compressed() {
            Some(FrameDecoder::new(PixelFormat::Mjpeg, width, height)?)
        } else {
            None
        };
        Ok(Self {
            routine,
            width,
            height,
            decoder,
        })
    }

    /// Selected routine.
    pub const fn routine(&self) -> ConversionRoutine {
        self.routine
    }

    /// Output encoding.
    pub const fn encoding(&self) -> Encoding {
        self.routine.encoding()
    }

    /// Whether a decoder context is held.
    pub const fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    /// Exact output size in bytes.
    pub const fn output_len(&self) -> usize {
        self.width as usize * self.height as usize * self.routine.encoding().bytes_per_pixel()
    }

    /// Convert one frame of `src` into `dst`.
    pub fn convert(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let expected = self.output_len();
        if dst.len() != expected {
            return Err(CameraError::Buffer(format!(
                "output holds {} bytes, frame needs {expected}",
                dst.len()
            )));
        }

        match self.decoder.as_mut() {
            Some(decoder) => {
                let frame = decoder.decode(src)?;
                self.routine.convert_planar(frame, dst)
            }
            None => self.routine.convert_packed(src, dst),
        }
    }
}
