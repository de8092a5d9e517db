//! Frame slot to multipart JPEG chunks

use std::convert::Infallible;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use tracing::{debug, warn};

use crate::capture::convert;
use crate::capture::Frame;
use crate::error::CameraError;
use crate::pipeline::FrameSlot;

/// Content type of a feed response. Both feeds use the boundary `frame`.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Encodes an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CameraError> {
    let mut jpeg = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| CameraError::Convert(e.to_string()))?;
    Ok(jpeg)
}

/// Wraps JPEG bytes in one multipart part.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    chunk.put_slice(PART_HEADER);
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Lazy multipart JPEG producer over a [`FrameSlot`]
///
/// Every pull re-encodes whatever the slot holds; there is no change
/// detection. When the slot is empty the encoder sleeps for the idle
/// interval and looks again, so the sequence never ends on its own.
#[derive(Clone)]
pub struct StreamEncoder {
    feed: &'static str,
    slot: Arc<FrameSlot>,
    quality: u8,
    idle: Duration,
    min_interval: Duration,
}

impl StreamEncoder {
    pub fn new(feed: &'static str, slot: Arc<FrameSlot>, quality: u8, idle: Duration) -> Self {
        Self {
            feed,
            slot,
            quality: quality.clamp(1, 100),
            idle,
            min_interval: Duration::ZERO,
        }
    }

    /// Minimum spacing between chunks of the async stream.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Converts and encodes one frame into a multipart chunk.
    pub fn encode_chunk(&self, frame: &Frame) -> Result<Bytes, CameraError> {
        let started = Instant::now();
        let rgb = convert::to_rgb(frame)?;
        let jpeg = encode_jpeg(&rgb, self.quality)?;
        metrics::histogram!("stream_encode_seconds", "feed" => self.feed)
            .record(started.elapsed().as_secs_f64());
        Ok(multipart_chunk(&jpeg))
    }

    /// One pull without waiting. `None` if the slot is empty or encoding failed.
    pub fn try_next_chunk(&self) -> Option<Bytes> {
        let frame = self.slot.read_copy()?;
        match self.encode_chunk(&frame) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                warn!(feed = self.feed, "Skipping frame {}: {}", frame.sequence(), e);
                None
            }
        }
    }

    /// Async stream of chunks for an HTTP body. Encoding runs on the
    /// blocking pool.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        debug!(feed = self.feed, "Client attached to stream");
        futures::stream::unfold((self, None::<Instant>), |(encoder, last)| async move {
            if let Some(last) = last {
                let elapsed = last.elapsed();
                if elapsed < encoder.min_interval {
                    tokio::time::sleep(encoder.min_interval - elapsed).await;
                }
            }
            loop {
                let worker = encoder.clone();
                match tokio::task::spawn_blocking(move || worker.try_next_chunk()).await {
                    Ok(Some(chunk)) => {
                        return Some((Ok(chunk), (encoder, Some(Instant::now()))));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(feed = encoder.feed, "Encode task failed: {}", e),
                }
                tokio::time::sleep(encoder.idle).await;
            }
        })
    }
}

/// Blocking pull; sleeps while no chunk is available.
impl Iterator for StreamEncoder {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.try_next_chunk() {
                return Some(chunk);
            }
            thread::sleep(self.idle);
        }
    }
}
