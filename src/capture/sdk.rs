//! Main camera driver on top of a vendor SDK running in pull mode
//!
//! The SDK signals events from its own threads. Those callbacks only forward
//! the event onto a channel; pulling pixels, publishing frames and reacting to
//! faults all happen on the driver's event thread. A second thread polls the
//! SDK frame-rate counters once per second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::{DriverState, Frame, PixelFormat};
use crate::error::CameraError;
use crate::pipeline::FrameSlot;

const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);
const TELEMETRY_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const PROGRESS_EVERY: u64 = 200;

/// Events raised by the SDK in pull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkEvent {
    /// A frame is ready to be pulled
    Image,
    /// A still image requested with `snap` is ready
    StillImage,
    Error,
    Disconnected,
}

/// Callback handed to the SDK when pull mode starts
pub type EventCallback = Box<dyn Fn(SdkEvent) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One enumerated camera
#[derive(Debug, Clone)]
pub struct SdkDeviceInfo {
    pub id: String,
    pub display_name: String,
    pub resolutions: Vec<Resolution>,
}

/// Raw SDK frame-rate counters
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRateCounters {
    /// Frames within the last `interval_ms`
    pub frames: u32,
    pub interval_ms: u32,
    pub total_frames: u32,
}

/// Vendor SDK entry points
pub trait CameraSdk: Send + Sync {
    fn enumerate(&self) -> Vec<SdkDeviceInfo>;

    /// `None` if the device could not be opened.
    fn open(&self, id: &str) -> Option<Box<dyn SdkHandle>>;
}

/// An open camera. Dropping the handle closes it.
pub trait SdkHandle: Send {
    fn resolution_index(&self) -> Result<usize, CameraError>;
    fn set_resolution_index(&mut self, index: usize) -> Result<(), CameraError>;
    /// `true` selects RGB byte order, `false` BGR.
    fn set_rgb_byte_order(&mut self, rgb: bool) -> Result<(), CameraError>;
    /// Real-time mode drops pending frames instead of queueing them.
    fn set_real_time(&mut self, enabled: bool) -> Result<(), CameraError>;
    fn set_vertical_flip(&mut self, flip: bool) -> Result<(), CameraError>;
    fn start_pull_mode(&mut self, callback: EventCallback) -> Result<(), CameraError>;
    /// Stops pull mode; the handle stays open.
    fn stop(&mut self) -> Result<(), CameraError>;
    /// Copies the pending frame into `buffer` using rows padded to 4 bytes.
    /// Returns the frame's (width, height).
    fn pull_image(&mut self, buffer: &mut [u8], bits_per_pixel: u32)
        -> Result<(u32, u32), CameraError>;
    fn frame_rate(&self) -> Result<FrameRateCounters, CameraError>;
    fn snap(&mut self, resolution_index: usize) -> Result<(), CameraError>;
}

/// Bytes per row for `bits` bits of pixel data, padded to 32 bits.
pub fn row_bytes(bits: u32) -> usize {
    (((bits + 31) & !31) / 8) as usize
}

/// Latest telemetry sample
#[derive(Debug, Clone, Serialize)]
pub struct FrameRateReport {
    pub fps: f64,
    pub total_frames: u32,
}

impl FrameRateReport {
    pub fn from_counters(counters: FrameRateCounters) -> Self {
        let fps = if counters.interval_ms > 0 {
            counters.frames as f64 * 1000.0 / counters.interval_ms as f64
        } else {
            0.0
        };
        Self {
            fps,
            total_frames: counters.total_frames,
        }
    }
}

impl std::fmt::Display for FrameRateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Total Frames: {}, FPS: {:.1}", self.total_frames, self.fps)
    }
}

/// Device description reported to the UI
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub resolution: String,
    pub resolution_index: usize,
    pub available_resolutions: Vec<String>,
}

/// Fixed settings applied on initialize
#[derive(Debug, Clone, Copy)]
pub struct SdkSettings {
    pub vertical_flip: bool,
    pub real_time: bool,
}

impl Default for SdkSettings {
    fn default() -> Self {
        Self {
            vertical_flip: true,
            real_time: true,
        }
    }
}

struct Callback(Box<dyn Fn(&str) + Send + Sync>);

enum DriverMessage {
    Event(SdkEvent),
    Shutdown,
}

struct Session {
    state: DriverState,
    handle: Option<Box<dyn SdkHandle>>,
    device: Option<SdkDeviceInfo>,
    resolution_index: usize,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    events: Option<flume::Sender<DriverMessage>>,
}

struct Inner {
    session: Mutex<Session>,
    slot: Arc<FrameSlot>,
    frame_count: AtomicU64,
    on_error: ArcSwapOption<Callback>,
    on_fps: ArcSwapOption<Callback>,
    last_fps: ArcSwapOption<FrameRateReport>,
}

#[derive(Default)]
struct Workers {
    event_thread: Option<JoinHandle<()>>,
    event_thread_id: Option<ThreadId>,
    telemetry_thread: Option<JoinHandle<()>>,
    telemetry_stop: Option<flume::Sender<()>>,
    telemetry_done: Option<flume::Receiver<()>>,
}

/// Vendor SDK camera publishing into a [`FrameSlot`]
pub struct SdkCamera {
    sdk: Arc<dyn CameraSdk>,
    settings: SdkSettings,
    inner: Arc<Inner>,
    workers: Mutex<Workers>,
}

impl SdkCamera {
    pub fn new(sdk: Arc<dyn CameraSdk>, settings: SdkSettings) -> Self {
        Self {
            sdk,
            settings,
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    state: DriverState::Uninitialized,
                    handle: None,
                    device: None,
                    resolution_index: 0,
                    width: 0,
                    height: 0,
                    buffer: Vec::new(),
                    events: None,
                }),
                slot: Arc::new(FrameSlot::new()),
                frame_count: AtomicU64::new(0),
                on_error: ArcSwapOption::empty(),
                on_fps: ArcSwapOption::empty(),
                last_fps: ArcSwapOption::empty(),
            }),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.inner.slot
    }

    pub fn state(&self) -> DriverState {
        self.inner.session().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == DriverState::Running
    }

    /// Frames published since the driver was created.
    pub fn frame_count(&self) -> u64 {
        self.inner.frame_count.load(Ordering::Relaxed)
    }

    pub fn last_frame_rate(&self) -> Option<FrameRateReport> {
        self.inner.last_fps.load_full().map(|r| (*r).clone())
    }

    /// Called with a message on initialization failures and hardware faults.
    pub fn set_error_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.inner
            .on_error
            .store(Some(Arc::new(Callback(Box::new(callback)))));
    }

    /// Called once per second with "Total Frames: N, FPS: X.X".
    pub fn set_fps_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.inner
            .on_fps
            .store(Some(Arc::new(Callback(Box::new(callback)))));
    }

    /// Opens the first camera and applies the fixed configuration.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<(), CameraError> {
        let result = self.try_initialize();
        if let Err(e) = &result {
            error!("Camera initialization failed: {}", e);
            self.inner.report_error(&e.to_string());
        }
        result
    }

    fn try_initialize(&self) -> Result<(), CameraError> {
        let mut session = self.inner.session();
        if session.state == DriverState::Running {
            return Ok(());
        }
        // Re-initializing replaces any previously opened handle.
        session.handle = None;

        let devices = self.sdk.enumerate();
        let device = devices.into_iter().next().ok_or(CameraError::NoDevice)?;
        let mut handle = self
            .sdk
            .open(&device.id)
            .ok_or_else(|| CameraError::OpenFailed(device.display_name.clone()))?;

        let index = handle.resolution_index()?;
        let res = *device
            .resolutions
            .get(index)
            .ok_or(CameraError::InvalidResolution {
                index,
                available: device.resolutions.len(),
            })?;

        handle.set_rgb_byte_order(true)?;
        if let Err(e) = handle.set_real_time(self.settings.real_time) {
            warn!("Failed to set real-time mode: {}", e);
        }
        handle.set_vertical_flip(self.settings.vertical_flip)?;

        session.buffer = vec![0; row_bytes(res.width * 24) * res.height as usize];
        session.resolution_index = index;
        session.width = res.width;
        session.height = res.height;
        session.handle = Some(handle);
        session.state = DriverState::Initialized;
        info!(
            "Camera initialized: {} at {}x{}",
            device.display_name, res.width, res.height
        );
        session.device = Some(device);
        Ok(())
    }

    /// Enters pull mode and spawns the event and telemetry threads.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), CameraError> {
        let mut workers = lock(&self.workers);
        let (tx, rx) = flume::unbounded();
        {
            let mut session = self.inner.session();
            match session.state {
                DriverState::Running => {
                    warn!("Start requested but camera is already running");
                    return Ok(());
                }
                DriverState::Initialized => {}
                _ => return Err(CameraError::NotInitialized),
            }
            let handle = session.handle.as_mut().ok_or(CameraError::NotInitialized)?;
            if let Err(e) = handle.start_pull_mode(event_callback(tx.clone())) {
                drop(session);
                drop(workers);
                self.stop();
                self.inner.report_error(&format!("Failed to start pull mode: {}", e));
                return Err(e);
            }
            session.events = Some(tx);
            session.state = DriverState::Running;
        }

        let inner = self.inner.clone();
        let event_thread = thread::Builder::new()
            .name("sdk-events".into())
            .spawn(move || inner.event_loop(rx))?;
        workers.event_thread_id = Some(event_thread.thread().id());
        workers.event_thread = Some(event_thread);

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let inner = self.inner.clone();
        let telemetry_thread = thread::Builder::new()
            .name("sdk-telemetry".into())
            .spawn(move || {
                inner.telemetry_loop(stop_rx);
                drop(done_tx);
            })?;
        workers.telemetry_thread = Some(telemetry_thread);
        workers.telemetry_stop = Some(stop_tx);
        workers.telemetry_done = Some(done_rx);

        info!("Camera stream started");
        Ok(())
    }

    /// Stops acquisition and closes the camera. Idempotent.
    pub fn stop(&self) {
        let workers = std::mem::take(&mut *lock(&self.workers));
        let events = {
            let mut session = self.inner.session();
            if matches!(
                session.state,
                DriverState::Initialized | DriverState::Running
            ) {
                info!("Stopping camera stream");
                session.state = DriverState::Stopped;
            }
            session.events.take()
        };

        if let Some(events) = events {
            let _ = events.send(DriverMessage::Shutdown);
        }

        drop(workers.telemetry_stop);
        if let Some(handle) = workers.telemetry_thread {
            let finished = workers
                .telemetry_done
                .map(|done| done.recv_timeout(TELEMETRY_JOIN_TIMEOUT))
                .map_or(true, |r| !matches!(r, Err(flume::RecvTimeoutError::Timeout)));
            if finished {
                let _ = handle.join();
            } else {
                warn!("Telemetry thread did not stop within {:?}", TELEMETRY_JOIN_TIMEOUT);
            }
        }

        if let Some(handle) = workers.event_thread {
            // Stop may be called from a callback running on the event thread.
            if workers.event_thread_id != Some(thread::current().id()) {
                let _ = handle.join();
            }
        }

        self.inner.close_handle();
    }

    /// Switches to another resolution while running.
    ///
    /// On failure the previous resolution is restored; if that fails too the
    /// driver is stopped and the error callback fires.
    #[instrument(skip(self))]
    pub fn set_resolution(&self, index: usize) -> Result<(), CameraError> {
        let mut session = self.inner.session();
        if session.state != DriverState::Running {
            return Err(CameraError::NotRunning);
        }
        let available = session.device.as_ref().map_or(0, |d| d.resolutions.len());
        if index >= available {
            return Err(CameraError::InvalidResolution { index, available });
        }
        let previous = session.resolution_index;

        let err = match apply_resolution(&mut session, index) {
            Ok(()) => {
                info!(
                    "Resolution changed to {}x{}",
                    session.width, session.height
                );
                return Ok(());
            }
            Err(e) => e,
        };
        warn!("Resolution change to index {} failed: {}", index, err);

        match apply_resolution(&mut session, previous) {
            Ok(()) => {
                info!("Restored resolution index {}", previous);
                Err(err)
            }
            Err(rollback) => {
                drop(session);
                error!("Resolution rollback failed: {}", rollback);
                self.inner.report_error(&format!(
                    "Resolution change failed and could not be undone: {}",
                    rollback
                ));
                self.stop();
                Err(err)
            }
        }
    }

    /// Requests a still image. The result arrives as a still-image event.
    pub fn snap(&self, resolution_index: usize) -> Result<(), CameraError> {
        let mut session = self.inner.session();
        if session.state != DriverState::Running {
            return Err(CameraError::NotRunning);
        }
        let handle = session.handle.as_mut().ok_or(CameraError::NotRunning)?;
        handle.snap(resolution_index)?;
        info!("Snap requested at resolution index {}", resolution_index);
        Ok(())
    }

    pub fn info(&self) -> Option<CameraInfo> {
        let session = self.inner.session();
        let device = session.device.as_ref()?;
        Some(CameraInfo {
            name: device.display_name.clone(),
            width: session.width,
            height: session.height,
            resolution: format!("{}x{}", session.width, session.height),
            resolution_index: session.resolution_index,
            available_resolutions: device
                .resolutions
                .iter()
                .map(|r| format!("{}x{}", r.width, r.height))
                .collect(),
        })
    }
}

impl Drop for SdkCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn report_error(&self, message: &str) {
        if let Some(cb) = self.on_error.load().as_ref() {
            (cb.0)(message);
        }
    }

    fn close_handle(&self) {
        let mut session = self.session();
        if let Some(mut handle) = session.handle.take() {
            if let Err(e) = handle.stop() {
                debug!("SDK stop on close failed: {}", e);
            }
            drop(handle);
            info!("Camera closed");
        }
        session.buffer = Vec::new();
        session.events = None;
    }

    fn event_loop(&self, rx: flume::Receiver<DriverMessage>) {
        while let Ok(message) = rx.recv() {
            match message {
                DriverMessage::Shutdown => break,
                DriverMessage::Event(SdkEvent::Image) => self.handle_image(),
                DriverMessage::Event(SdkEvent::StillImage) => {
                    info!("Still image captured");
                }
                DriverMessage::Event(event @ (SdkEvent::Error | SdkEvent::Disconnected)) => {
                    if self.handle_fault(event) {
                        break;
                    }
                }
            }
        }
        debug!("SDK event loop exited");
    }

    fn handle_image(&self) {
        let frame = {
            let mut session = self.session();
            if session.state != DriverState::Running {
                return;
            }
            let Session { handle, buffer, .. } = &mut *session;
            let Some(handle) = handle.as_mut() else {
                return;
            };
            let (width, height) = match handle.pull_image(buffer, 24) {
                Ok(dims) => dims,
                Err(e) => {
                    debug!("Pull image failed: {}", e);
                    return;
                }
            };
            match pack_rgb(buffer, width, height) {
                Some(data) => data,
                None => {
                    warn!("Pulled {}x{} frame does not fit the receive buffer", width, height);
                    return;
                }
            }
        };

        let count = self.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        let (data, width, height) = frame;
        self.slot
            .write(Frame::new(data, width, height, PixelFormat::Rgb24, count));
        metrics::counter!("main_frames_acquired").increment(1);
        if count % PROGRESS_EVERY == 0 {
            info!("{} frames processed", count);
        }
    }

    // Returns true when the fault stopped the driver.
    fn handle_fault(&self, event: SdkEvent) -> bool {
        {
            let mut session = self.session();
            if session.state != DriverState::Running {
                return false;
            }
            session.state = DriverState::Stopped;
        }
        let message = format!("Camera error or disconnected (event: {:?})", event);
        error!("{}", message);
        self.report_error(&message);
        self.close_handle();
        true
    }

    fn telemetry_loop(&self, stop: flume::Receiver<()>) {
        loop {
            let counters = {
                let session = self.session();
                if session.state != DriverState::Running {
                    break;
                }
                session.handle.as_ref().map(|h| h.frame_rate())
            };
            match counters {
                Some(Ok(counters)) => {
                    let report = FrameRateReport::from_counters(counters);
                    metrics::gauge!("main_camera_fps").set(report.fps);
                    if let Some(cb) = self.on_fps.load().as_ref() {
                        (cb.0)(&report.to_string());
                    }
                    self.last_fps.store(Some(Arc::new(report)));
                }
                Some(Err(e)) => warn!("Error getting FPS: {}", e),
                None => break,
            }

            match stop.recv_timeout(TELEMETRY_PERIOD) {
                Err(flume::RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        debug!("Telemetry loop exited");
    }
}

fn apply_resolution(session: &mut Session, index: usize) -> Result<(), CameraError> {
    let res = *session
        .device
        .as_ref()
        .and_then(|d| d.resolutions.get(index))
        .ok_or(CameraError::InvalidResolution {
            index,
            available: 0,
        })?;
    let events = session.events.clone().ok_or(CameraError::NotRunning)?;
    let handle = session.handle.as_mut().ok_or(CameraError::NotRunning)?;

    handle.stop()?;
    handle.set_resolution_index(index)?;
    session.resolution_index = index;
    session.width = res.width;
    session.height = res.height;
    session.buffer = vec![0; row_bytes(res.width * 24) * res.height as usize];
    handle.start_pull_mode(event_callback(events))
}

fn event_callback(tx: flume::Sender<DriverMessage>) -> EventCallback {
    Box::new(move |event| {
        let _ = tx.send(DriverMessage::Event(event));
    })
}

// Drops the 4-byte row padding of a pulled RGB24 image.
fn pack_rgb(buffer: &[u8], width: u32, height: u32) -> Option<(Vec<u8>, u32, u32)> {
    let stride = row_bytes(width * 24);
    let row = width as usize * 3;
    if buffer.len() < stride * height as usize {
        return None;
    }
    let mut data = Vec::with_capacity(row * height as usize);
    for chunk in buffer.chunks_exact(stride).take(height as usize) {
        data.extend_from_slice(&chunk[..row]);
    }
    Some((data, width, height))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::SimulatedSdk;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn camera(sdk: &Arc<SimulatedSdk>) -> SdkCamera {
        SdkCamera::new(sdk.clone(), SdkSettings::default())
    }

    #[test]
    fn row_bytes_pads_to_four() {
        assert_eq!(row_bytes(640 * 24), 1920);
        assert_eq!(row_bytes(5 * 24), 16);
        assert_eq!(row_bytes(1), 4);
    }

    #[test]
    fn fps_report_formatting() {
        let report = FrameRateReport::from_counters(FrameRateCounters {
            frames: 25,
            interval_ms: 1000,
            total_frames: 300,
        });
        assert_eq!(report.to_string(), "Total Frames: 300, FPS: 25.0");
        let idle = FrameRateReport::from_counters(FrameRateCounters::default());
        assert_eq!(idle.fps, 0.0);
    }

    #[test]
    fn pack_rgb_strips_padding() {
        // 1x2 image, rows padded from 3 to 4 bytes.
        let buffer = [1, 2, 3, 0, 4, 5, 6, 0];
        let (data, w, h) = pack_rgb(&buffer, 1, 2).unwrap();
        assert_eq!((w, h), (1, 2));
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6]);
        assert!(pack_rgb(&buffer, 2, 2).is_none());
    }

    #[test]
    fn initialize_without_devices_fails() {
        let sdk = Arc::new(SimulatedSdk::without_devices());
        let camera = camera(&sdk);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        camera.set_error_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(camera.initialize(), Err(CameraError::NoDevice)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(camera.state(), DriverState::Uninitialized);
    }

    #[test]
    fn open_failure_is_reported() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        sdk.set_open_fails(true);
        let camera = camera(&sdk);
        assert!(matches!(camera.initialize(), Err(CameraError::OpenFailed(_))));
        assert_eq!(camera.state(), DriverState::Uninitialized);
    }

    #[test]
    fn start_requires_initialize() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        assert!(matches!(camera.start(), Err(CameraError::NotInitialized)));
    }

    #[test]
    fn initialize_applies_fixed_configuration() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.initialize().unwrap();
        assert_eq!(camera.state(), DriverState::Initialized);
        let config = sdk.applied_config();
        assert!(config.rgb_byte_order);
        assert!(config.real_time);
        assert!(config.vertical_flip);

        let info = camera.info().unwrap();
        assert_eq!(info.resolution, "320x240");
        assert_eq!(info.available_resolutions.len(), 2);
    }

    #[test]
    fn streams_frames_and_stops() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.initialize().unwrap();
        camera.start().unwrap();
        assert!(camera.is_running());

        assert!(wait_for(Duration::from_secs(2), || camera.frame_count() >= 3));
        let frame = camera.slot().read_copy().unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert_eq!(frame.format(), PixelFormat::Rgb24);
        assert_eq!(frame.data.len(), 320 * 240 * 3);

        camera.stop();
        assert_eq!(camera.state(), DriverState::Stopped);
        assert!(!sdk.is_open());
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.stop();
        camera.initialize().unwrap();
        camera.start().unwrap();

        let started = Instant::now();
        camera.stop();
        camera.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(camera.state(), DriverState::Stopped);
    }

    #[test]
    fn disconnect_stops_driver_and_reports() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        camera.set_error_callback(move |msg| sink.lock().unwrap().push(msg.to_string()));
        camera.initialize().unwrap();
        camera.start().unwrap();

        sdk.inject(SdkEvent::Disconnected);
        assert!(wait_for(Duration::from_secs(2), || camera.state()
            == DriverState::Stopped));
        assert!(wait_for(Duration::from_secs(2), || !sdk.is_open()));
        assert_eq!(messages.lock().unwrap().len(), 1);
        assert!(messages.lock().unwrap()[0].contains("Disconnected"));

        // Stop afterwards is still harmless.
        camera.stop();
    }

    #[test]
    fn still_image_event_is_only_logged() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.initialize().unwrap();
        camera.start().unwrap();
        camera.snap(0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(camera.is_running());
        camera.stop();
    }

    #[test]
    fn resolution_change_updates_frames() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.initialize().unwrap();
        assert!(matches!(
            camera.set_resolution(1),
            Err(CameraError::NotRunning)
        ));
        camera.start().unwrap();

        camera.set_resolution(1).unwrap();
        assert_eq!(camera.info().unwrap().resolution, "160x120");
        assert!(wait_for(Duration::from_secs(2), || camera
            .slot()
            .read_copy()
            .is_some_and(|f| f.width() == 160 && f.height() == 120)));

        assert!(matches!(
            camera.set_resolution(7),
            Err(CameraError::InvalidResolution { index: 7, .. })
        ));
        camera.stop();
    }

    #[test]
    fn failed_resolution_change_rolls_back() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        camera.initialize().unwrap();
        camera.start().unwrap();

        sdk.reject_resolution(Some(1));
        assert!(camera.set_resolution(1).is_err());
        assert!(camera.is_running());
        assert_eq!(camera.info().unwrap().resolution_index, 0);
        camera.stop();
    }

    #[test]
    fn telemetry_reports_fps() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = camera(&sdk);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        camera.set_fps_callback(move |text| sink.lock().unwrap().push(text.to_string()));
        camera.initialize().unwrap();
        camera.start().unwrap();

        assert!(wait_for(Duration::from_secs(3), || !reports
            .lock()
            .unwrap()
            .is_empty()));
        assert!(reports.lock().unwrap()[0].starts_with("Total Frames: "));
        assert!(camera.last_frame_rate().is_some());
        camera.stop();
    }

    #[test]
    fn stop_from_error_callback_does_not_deadlock() {
        let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
        let camera = Arc::new(camera(&sdk));
        let weak = Arc::downgrade(&camera);
        camera.set_error_callback(move |_| {
            if let Some(camera) = weak.upgrade() {
                camera.stop();
            }
        });
        camera.initialize().unwrap();
        camera.start().unwrap();
        sdk.inject(SdkEvent::Error);
        assert!(wait_for(Duration::from_secs(2), || camera.state()
            == DriverState::Stopped));
        camera.stop();
    }
}
