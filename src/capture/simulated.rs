//! Hardware-free camera backends
//!
//! [`PatternProvider`] stands in for a V4L2 device and [`SimulatedSdk`] for
//! the vendor SDK. Both are used by the `pattern` preview backend and by tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use super::sdk::{
    row_bytes, CameraSdk, EventCallback, FrameRateCounters, Resolution, SdkDeviceInfo, SdkEvent,
    SdkHandle,
};
use super::usb::{VideoDevice, VideoDeviceProvider};
use super::{Frame, PixelFormat};
use crate::error::CameraError;

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Solid([u8; 3]),
    /// Gradient with a bar sweeping left to right
    Moving,
}

/// Synthetic RGB24 video source
pub struct PatternProvider {
    width: u32,
    height: u32,
    pattern: Pattern,
    open_fails: bool,
    fail_every: Option<u64>,
    opened: AtomicUsize,
}

impl PatternProvider {
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::with_pattern(width, height, Pattern::Solid(rgb))
    }

    pub fn moving(width: u32, height: u32) -> Self {
        Self::with_pattern(width, height, Pattern::Moving)
    }

    /// Provider whose devices never open
    pub fn failing_open() -> Self {
        Self {
            open_fails: true,
            ..Self::solid(1, 1, [0, 0, 0])
        }
    }

    /// Every `n`th read fails.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Number of open attempts, failed ones included
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn with_pattern(width: u32, height: u32, pattern: Pattern) -> Self {
        Self {
            width,
            height,
            pattern,
            open_fails: false,
            fail_every: None,
            opened: AtomicUsize::new(0),
        }
    }
}

impl VideoDeviceProvider for PatternProvider {
    fn open(&self, index: usize) -> Result<Box<dyn VideoDevice>, CameraError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.open_fails {
            return Err(CameraError::OpenFailed(format!("pattern device {}", index)));
        }
        Ok(Box::new(PatternDevice {
            width: self.width,
            height: self.height,
            pattern: self.pattern,
            fail_every: self.fail_every,
            reads: 0,
            sequence: 0,
        }))
    }
}

struct PatternDevice {
    width: u32,
    height: u32,
    pattern: Pattern,
    fail_every: Option<u64>,
    reads: u64,
    sequence: u64,
}

impl VideoDevice for PatternDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.reads += 1;
        if self.fail_every.is_some_and(|n| self.reads % n == 0) {
            return Err(CameraError::Device("simulated read failure".into()));
        }
        self.sequence += 1;
        let frame = match self.pattern {
            Pattern::Solid(rgb) => Frame::solid_rgb(self.width, self.height, rgb, self.sequence),
            Pattern::Moving => {
                let mut data = vec![0; (self.width * self.height * 3) as usize];
                fill_moving(&mut data, self.width, self.height, self.width * 3, self.sequence);
                Frame::new(data, self.width, self.height, PixelFormat::Rgb24, self.sequence)
            }
        };
        Ok(frame)
    }
}

// Writes a gradient with a white vertical bar whose position depends on `tick`.
fn fill_moving(buffer: &mut [u8], width: u32, height: u32, stride: u32, tick: u64) {
    if width == 0 {
        return;
    }
    let bar = (tick * 4 % width as u64) as u32;
    for y in 0..height {
        let row = &mut buffer[(y * stride) as usize..];
        for x in 0..width {
            let px = &mut row[(x * 3) as usize..(x * 3 + 3) as usize];
            if x.abs_diff(bar) < 4 {
                px.copy_from_slice(&[255, 255, 255]);
            } else {
                px[0] = (x * 255 / width) as u8;
                px[1] = (y * 255 / height.max(1)) as u8;
                px[2] = 96;
            }
        }
    }
}

/// Settings the driver pushed into the simulated camera
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedConfig {
    pub rgb_byte_order: bool,
    pub real_time: bool,
    pub vertical_flip: bool,
}

struct SimState {
    open: bool,
    open_fails: bool,
    reject_resolution: Option<usize>,
    config: AppliedConfig,
    resolution_index: usize,
    callback: Option<Arc<EventCallback>>,
    total_frames: u32,
    window_frames: u32,
    window_start: Instant,
}

/// In-process stand-in for the vendor SDK
///
/// One camera is enumerated. While in pull mode an internal thread raises an
/// image event every `frame_interval`, like the vendor library does from its
/// own threads.
pub struct SimulatedSdk {
    devices: Vec<SdkDeviceInfo>,
    frame_interval: Duration,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSdk {
    pub fn new(frame_interval: Duration) -> Self {
        Self::with_devices(
            vec![SdkDeviceInfo {
                id: "sim-0".into(),
                display_name: "Simulated Microscope Camera".into(),
                resolutions: vec![
                    Resolution {
                        width: 320,
                        height: 240,
                    },
                    Resolution {
                        width: 160,
                        height: 120,
                    },
                ],
            }],
            frame_interval,
        )
    }

    pub fn without_devices() -> Self {
        Self::with_devices(Vec::new(), Duration::from_millis(40))
    }

    pub fn with_devices(devices: Vec<SdkDeviceInfo>, frame_interval: Duration) -> Self {
        Self {
            devices,
            frame_interval,
            state: Arc::new(Mutex::new(SimState {
                open: false,
                open_fails: false,
                reject_resolution: None,
                config: AppliedConfig::default(),
                resolution_index: 0,
                callback: None,
                total_frames: 0,
                window_frames: 0,
                window_start: Instant::now(),
            })),
        }
    }

    pub fn set_open_fails(&self, fails: bool) {
        lock(&self.state).open_fails = fails;
    }

    /// Makes `set_resolution_index` fail for the given index.
    pub fn reject_resolution(&self, index: Option<usize>) {
        lock(&self.state).reject_resolution = index;
    }

    pub fn applied_config(&self) -> AppliedConfig {
        lock(&self.state).config
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Raises `event` as if it came from the SDK. Ignored outside pull mode.
    pub fn inject(&self, event: SdkEvent) {
        let callback = lock(&self.state).callback.clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

impl CameraSdk for SimulatedSdk {
    fn enumerate(&self) -> Vec<SdkDeviceInfo> {
        self.devices.clone()
    }

    fn open(&self, id: &str) -> Option<Box<dyn SdkHandle>> {
        let device = self.devices.iter().find(|d| d.id == id)?.clone();
        let mut state = lock(&self.state);
        if state.open_fails {
            return None;
        }
        state.open = true;
        state.resolution_index = 0;
        state.config = AppliedConfig::default();
        Some(Box::new(SimulatedHandle {
            device,
            frame_interval: self.frame_interval,
            state: self.state.clone(),
            ticker: None,
        }))
    }
}

struct Ticker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct SimulatedHandle {
    device: SdkDeviceInfo,
    frame_interval: Duration,
    state: Arc<Mutex<SimState>>,
    ticker: Option<Ticker>,
}

impl SimulatedHandle {
    fn resolution(&self) -> Result<Resolution, CameraError> {
        let index = lock(&self.state).resolution_index;
        self.device
            .resolutions
            .get(index)
            .copied()
            .ok_or_else(|| CameraError::sdk("resolution_index", "no such resolution"))
    }
}

impl SdkHandle for SimulatedHandle {
    fn resolution_index(&self) -> Result<usize, CameraError> {
        Ok(lock(&self.state).resolution_index)
    }

    fn set_resolution_index(&mut self, index: usize) -> Result<(), CameraError> {
        if self.ticker.is_some() {
            return Err(CameraError::sdk("set_resolution_index", "camera is streaming"));
        }
        let mut state = lock(&self.state);
        if index >= self.device.resolutions.len() || state.reject_resolution == Some(index) {
            return Err(CameraError::sdk("set_resolution_index", format!("index {} rejected", index)));
        }
        state.resolution_index = index;
        Ok(())
    }

    fn set_rgb_byte_order(&mut self, rgb: bool) -> Result<(), CameraError> {
        lock(&self.state).config.rgb_byte_order = rgb;
        Ok(())
    }

    fn set_real_time(&mut self, enabled: bool) -> Result<(), CameraError> {
        lock(&self.state).config.real_time = enabled;
        Ok(())
    }

    fn set_vertical_flip(&mut self, flip: bool) -> Result<(), CameraError> {
        lock(&self.state).config.vertical_flip = flip;
        Ok(())
    }

    fn start_pull_mode(&mut self, callback: EventCallback) -> Result<(), CameraError> {
        if self.ticker.is_some() {
            return Err(CameraError::sdk("start_pull_mode", "already started"));
        }
        let callback = Arc::new(callback);
        {
            let mut state = lock(&self.state);
            state.callback = Some(callback.clone());
            state.window_start = Instant::now();
            state.window_frames = 0;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval = self.frame_interval;
        let thread = thread::Builder::new()
            .name("sim-sdk".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if !flag.load(Ordering::Acquire) {
                        callback(SdkEvent::Image);
                    }
                }
            })?;
        self.ticker = Some(Ticker { stop, thread });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop.store(true, Ordering::Release);
            if ticker.thread.join().is_err() {
                debug!("Simulated SDK thread panicked");
            }
        }
        lock(&self.state).callback = None;
        Ok(())
    }

    fn pull_image(
        &mut self,
        buffer: &mut [u8],
        bits_per_pixel: u32,
    ) -> Result<(u32, u32), CameraError> {
        if bits_per_pixel != 24 {
            return Err(CameraError::sdk("pull_image", "only 24 bpp is supported"));
        }
        let res = self.resolution()?;
        let stride = row_bytes(res.width * 24);
        if buffer.len() < stride * res.height as usize {
            return Err(CameraError::sdk("pull_image", "buffer too small"));
        }
        let total = {
            let mut state = lock(&self.state);
            state.total_frames = state.total_frames.wrapping_add(1);
            state.window_frames += 1;
            state.total_frames
        };
        fill_moving(buffer, res.width, res.height, stride as u32, total as u64);
        Ok((res.width, res.height))
    }

    fn frame_rate(&self) -> Result<FrameRateCounters, CameraError> {
        let mut state = lock(&self.state);
        let counters = FrameRateCounters {
            frames: state.window_frames,
            interval_ms: state.window_start.elapsed().as_millis() as u32,
            total_frames: state.total_frames,
        };
        state.window_frames = 0;
        state.window_start = Instant::now();
        Ok(counters)
    }

    fn snap(&mut self, resolution_index: usize) -> Result<(), CameraError> {
        if resolution_index >= self.device.resolutions.len() {
            return Err(CameraError::sdk("snap", "no such resolution"));
        }
        let callback = lock(&self.state).callback.clone();
        if let Some(callback) = callback {
            callback(SdkEvent::StillImage);
        }
        Ok(())
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        let _ = SdkHandle::stop(self);
        lock(&self.state).open = false;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
