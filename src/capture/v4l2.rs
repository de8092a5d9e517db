//! V4L2 backend for the USB preview camera

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, PixelFormat};
use super::usb::{VideoDevice, VideoDeviceProvider};
use crate::error::CameraError;
use crate::PreviewConfig;

/// Opens `/dev/video<index>` with the configured format
pub struct V4l2Provider {
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer_count: u32,
}

impl V4l2Provider {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            buffer_count: config.buffer_count.max(1),
        }
    }
}

impl VideoDeviceProvider for V4l2Provider {
    #[instrument(skip(self))]
    fn open(&self, index: usize) -> Result<Box<dyn VideoDevice>, CameraError> {
        let device = Device::new(index).map_err(|e| CameraError::OpenFailed(e.to_string()))?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::OpenFailed(format!(
                "{} doesn't support video capture",
                caps.card
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = fourcc_for(self.format)?;
        let fmt = device.set_format(&fmt)?;

        // The driver may pick a different size or format than requested.
        let format = format_for(fmt.fourcc).ok_or_else(|| {
            CameraError::OpenFailed(format!("Device chose unsupported format {}", fmt.fourcc))
        })?;
        if (fmt.width, fmt.height) != (self.width, self.height) {
            warn!(
                "Requested {}x{}, device delivers {}x{}",
                self.width, self.height, fmt.width, fmt.height
            );
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)?;
        info!(
            "Capture stream started with {} buffers ({:?} {}x{})",
            self.buffer_count, format, fmt.width, fmt.height
        );

        Ok(Box::new(V4l2Device {
            _device: device,
            stream,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
            sequence: 0,
        }))
    }
}

struct V4l2Device {
    _device: Device,
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
}

impl VideoDevice for V4l2Device {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(CameraError::Device("Empty buffer dequeued".into()));
        }
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;
        let mut frame = Frame::new(data, self.width, self.height, self.format, self.sequence);
        if self.format != PixelFormat::Mjpeg && self.stride > 0 {
            let meta = std::sync::Arc::make_mut(&mut frame.meta);
            meta.stride = self.stride;
        }
        Ok(frame)
    }
}

fn fourcc_for(format: PixelFormat) -> Result<FourCC, CameraError> {
    match format {
        PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Ok(FourCC::new(b"YUYV")),
        PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Ok(FourCC::new(b"BGR3")),
    }
}

pub(crate) fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        _ => None,
    }
}
