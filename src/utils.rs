use crate::capture::frame::PixelFormat;
use crate::capture::v4l2::format_for;
use serde::Serialize;
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device};

// Detected capture device info
#[derive(Debug, Clone, Serialize)]
pub struct FoundDevice {
    pub index: usize,
    pub card: String,
    pub format: PixelFormat,
}

/// Auto-detect the first usable capture device, preferring MJPEG.
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for index in 0..10 {
        let path = format!("/dev/video{}", index);
        if !std::path::Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::new(index) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        let supported: Vec<PixelFormat> = formats
            .iter()
            .filter_map(|fmt| format_for(fmt.fourcc))
            .collect();
        let best = preferred_format(&supported);
        if let Some(format) = best {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            return Some(FoundDevice {
                index,
                card: caps.card,
                format,
            });
        }
    }

    None
}

/// Picks MJPEG first, then YUYV, then raw RGB/BGR.
pub fn preferred_format(supported: &[PixelFormat]) -> Option<PixelFormat> {
    [
        PixelFormat::Mjpeg,
        PixelFormat::Yuyv4,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
    ]
    .into_iter()
    .find(|f| supported.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_is_preferred() {
        assert_eq!(
            preferred_format(&[PixelFormat::Yuyv4, PixelFormat::Mjpeg]),
            Some(PixelFormat::Mjpeg)
        );
        assert_eq!(
            preferred_format(&[PixelFormat::Bgr24, PixelFormat::Yuyv4]),
            Some(PixelFormat::Yuyv4)
        );
        assert_eq!(preferred_format(&[]), None);
    }
}
