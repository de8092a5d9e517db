use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// A single camera frame.
///
/// Pixel data is immutable once built, so a clone shares the buffer and can
/// never observe a later write.
#[derive(Clone)]
pub struct Frame {
    /// Pixel data in row major order
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Acquisition timestamp
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }
}

impl Frame {
    /// Builds a tightly packed frame; stride is derived from the format.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        let stride = format.bytes_per_pixel().map_or(0, |bpp| width * bpp);
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride,
                format,
            }),
            timestamp: Instant::now(),
        }
    }

    /// A frame filled with one RGB color.
    pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        let data: Vec<u8> = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(data, width, height, PixelFormat::Rgb24, sequence)
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}
