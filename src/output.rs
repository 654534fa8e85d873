//! Caller-owned output image.

use std::fmt;
use std::time::Duration;

/// Pixel encoding of an output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Packed 8-bit RGB.
    Rgb8,
    /// Single-channel 8-bit grey.
    Mono8,
}

impl Encoding {
    /// Tag understood by image consumers (`rgb8`, `mono8`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rgb8 => "rgb8",
            Self::Mono8 => "mono8",
        }
    }

    /// Bytes per output pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Mono8 => 1,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image descriptor filled in place by a grab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel encoding.
    pub encoding: Encoding,
    /// Bytes per row.
    pub step: usize,
    /// Pixel bytes, `step * height` long.
    pub data: Vec<u8>,
    /// Sequence number of the source frame.
    pub sequence: u32,
    /// Capture timestamp of the source frame.
    pub timestamp: Duration,
}

impl Default for OutputImage {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputImage {
    /// An empty image; the first grab sizes it.
    pub const fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            encoding: Encoding::Rgb8,
            step: 0,
            data: Vec::new(),
            sequence: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Set the layout and size `data` to hold exactly one frame.
    ///
    /// Reuses the existing allocation when it is large enough.
    pub fn reshape(&mut self, width: u32, height: u32, encoding: Encoding) {
        self.width = width;
        self.height = height;
        self.encoding = encoding;
        self.step = width as usize * encoding.bytes_per_pixel();
        self.data.resize(self.step * height as usize, 0);
    }

    /// RGB value of a pixel; grey images repeat the luma.
    ///
    /// Returns `None` outside the image.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.encoding.bytes_per_pixel();
        let offset = y as usize * self.step + x as usize * bpp;
        match self.encoding {
            Encoding::Rgb8 => {
                let px = self.data.get(offset..offset + 3)?;
                Some((*px.first()?, *px.get(1)?, *px.get(2)?))
            }
            Encoding::Mono8 => {
                let v = *self.data.get(offset)?;
                Some((v, v, v))
            }
        }
    }
}
