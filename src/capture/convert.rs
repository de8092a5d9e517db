//! Color-space conversion of captured frames into displayable RGB

use image::RgbImage;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{Frame, PixelFormat};
use crate::error::CameraError;

/// Converts a frame of any supported format into an RGB image.
pub fn to_rgb(frame: &Frame) -> Result<RgbImage, CameraError> {
    let (width, height) = (frame.width(), frame.height());
    match frame.format() {
        PixelFormat::Rgb24 => {
            let data = packed_rows(frame, 3)?;
            RgbImage::from_raw(width, height, data)
                .ok_or_else(|| CameraError::Convert("RGB buffer too small".into()))
        }
        PixelFormat::Bgr24 => {
            let mut data = packed_rows(frame, 3)?;
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            RgbImage::from_raw(width, height, data)
                .ok_or_else(|| CameraError::Convert("BGR buffer too small".into()))
        }
        PixelFormat::Yuyv4 => {
            let packed = packed_rows(frame, 2)?;
            let data = yuyv_to_rgb(&packed);
            RgbImage::from_raw(width, height, data)
                .ok_or_else(|| CameraError::Convert("YUYV buffer too small".into()))
        }
        PixelFormat::Mjpeg => decode_jpeg(&frame.data),
    }
}

/// Decodes a JPEG into an RGB image, expanding greyscale if needed.
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, CameraError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CameraError::Convert(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| CameraError::Convert("JPEG has no header info".into()))?;

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(CameraError::Convert(format!(
                "Unsupported JPEG pixel format: {:?}",
                other
            )))
        }
    };

    RgbImage::from_raw(info.width as u32, info.height as u32, rgb)
        .ok_or_else(|| CameraError::Convert("Decoded JPEG size mismatch".into()))
}

// Strips row padding so the result is width*bpp bytes per row.
fn packed_rows(frame: &Frame, bpp: u32) -> Result<Vec<u8>, CameraError> {
    let row = (frame.width() * bpp) as usize;
    let stride = (frame.meta.stride as usize).max(row);
    let height = frame.height() as usize;
    if frame.data.len() < stride * (height.saturating_sub(1)) + row {
        return Err(CameraError::Convert(format!(
            "Frame buffer of {} bytes too small for {}x{}",
            frame.data.len(),
            frame.width(),
            frame.height()
        )));
    }
    if stride == row {
        return Ok(frame.data[..row * height].to_vec());
    }
    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
        let start = y * stride;
        out.extend_from_slice(&frame.data[start..start + row]);
    }
    Ok(out)
}

fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

// BT.601 limited range.
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
