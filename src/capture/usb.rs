//! Polling acquisition driver for generic USB video devices

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, warn};

use super::{DriverState, Frame};
use crate::error::CameraError;
use crate::pipeline::FrameSlot;

/// Upper bound on a single `read_frame` call, added to the poll interval when
/// waiting for a previous run to release the device.
const READ_GRACE: Duration = Duration::from_secs(1);

/// An open video device. Dropping it releases the device.
pub trait VideoDevice: Send {
    /// Reads one frame. Failures are treated as transient by the driver.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens video devices by index.
pub trait VideoDeviceProvider: Send + Sync {
    fn open(&self, index: usize) -> Result<Box<dyn VideoDevice>, CameraError>;
}

/// Background driver that keeps a [`FrameSlot`] filled from a USB camera.
pub struct UsbCamera {
    provider: Arc<dyn VideoDeviceProvider>,
    device_index: usize,
    poll_interval: Duration,
    slot: Arc<FrameSlot>,
    shared: Arc<Mutex<Shared>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: DriverState,
    /// Incremented on every start
    run: u64,
    /// Dropping this wakes and ends the current run
    stop: Option<Sender<()>>,
}

impl UsbCamera {
    pub fn new(
        provider: Arc<dyn VideoDeviceProvider>,
        device_index: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            device_index,
            poll_interval,
            slot: Arc::new(FrameSlot::new()),
            shared: Arc::new(Mutex::new(Shared {
                state: DriverState::Stopped,
                run: 0,
                stop: None,
            })),
            worker: Mutex::new(None),
        }
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn state(&self) -> DriverState {
        lock(&self.shared).state
    }

    /// True while starting or running.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), DriverState::Starting | DriverState::Running)
    }

    /// Spawns the acquisition thread. No-op if already active.
    ///
    /// A previous run must have released the device first; `start` waits for
    /// it and fails if it is still holding on after one read. The device is
    /// opened on the acquisition thread; an open failure is only logged and
    /// leaves the driver stopped.
    #[instrument(skip(self), fields(device = self.device_index))]
    pub fn start(&self) -> Result<(), CameraError> {
        let mut worker = lock(&self.worker);
        if self.is_active() {
            debug!("USB camera already running");
            return Ok(());
        }

        if let Some(previous) = worker.take() {
            match wait_finished(previous, self.poll_interval + READ_GRACE) {
                Ok(()) => {}
                Err(previous) => {
                    *worker = Some(previous);
                    warn!("Previous USB capture run has not released the device");
                    return Err(CameraError::Device(format!(
                        "device {} is still in use by the previous capture run",
                        self.device_index
                    )));
                }
            }
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        let run = {
            let mut shared = lock(&self.shared);
            shared.run += 1;
            shared.state = DriverState::Starting;
            shared.stop = Some(stop_tx);
            shared.run
        };

        let ctx = LoopContext {
            provider: self.provider.clone(),
            device_index: self.device_index,
            poll_interval: self.poll_interval,
            slot: self.slot.clone(),
            shared: self.shared.clone(),
            run,
            stop: stop_rx,
        };
        let spawned = thread::Builder::new()
            .name(format!("usb-capture-{}", self.device_index))
            .spawn(move || ctx.run());

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut shared = lock(&self.shared);
                shared.state = DriverState::Stopped;
                shared.stop = None;
                Err(CameraError::Io(e))
            }
        }
    }

    /// Signals the acquisition loop to exit. Idempotent and non-blocking.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        if shared.stop.take().is_some() {
            info!(device = self.device_index, "USB camera stop requested");
        }
        shared.state = DriverState::Stopped;
    }

    /// Waits for the acquisition thread to exit, up to `timeout`.
    pub fn join(&self, timeout: Duration) -> bool {
        let Some(handle) = lock(&self.worker).take() else {
            return true;
        };
        match wait_finished(handle, timeout) {
            Ok(()) => true,
            Err(handle) => {
                *lock(&self.worker) = Some(handle);
                false
            }
        }
    }
}

impl Drop for UsbCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

// Joins `handle` if it finishes within `timeout`, otherwise hands it back.
fn wait_finished(handle: JoinHandle<()>, timeout: Duration) -> Result<(), JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(2));
    }
    if handle.join().is_err() {
        error!("USB capture thread panicked");
    }
    Ok(())
}

struct LoopContext {
    provider: Arc<dyn VideoDeviceProvider>,
    device_index: usize,
    poll_interval: Duration,
    slot: Arc<FrameSlot>,
    shared: Arc<Mutex<Shared>>,
    run: u64,
    stop: Receiver<()>,
}

impl LoopContext {
    fn run(self) {
        info!(device = self.device_index, "Starting USB capture loop");
        let mut device = match self.provider.open(self.device_index) {
            Ok(device) => device,
            Err(e) => {
                error!(device = self.device_index, "Cannot open USB camera: {}", e);
                self.finish();
                return;
            }
        };

        {
            let mut shared = lock(&self.shared);
            if !self.is_current(&shared) {
                return;
            }
            shared.state = DriverState::Running;
        }

        loop {
            match device.read_frame() {
                Ok(frame) => {
                    self.slot.write(frame);
                    metrics::counter!("preview_frames_acquired").increment(1);
                }
                Err(e) => debug!("USB frame read failed: {}", e),
            }
            match self.stop.recv_timeout(self.poll_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(device);
        info!(device = self.device_index, "USB capture loop stopped");
    }

    fn is_current(&self, shared: &Shared) -> bool {
        shared.run == self.run && shared.stop.is_some()
    }

    // Marks the driver stopped unless it was stopped or restarted meanwhile.
    fn finish(&self) {
        let mut shared = lock(&self.shared);
        if self.is_current(&shared) {
            shared.state = DriverState::Stopped;
            shared.stop = None;
        } else {
            debug!("USB capture run was stopped before the device opened");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::PatternProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    #[test]
    fn fills_slot_and_stops() {
        let provider = Arc::new(PatternProvider::solid(64, 48, [0, 255, 0]));
        let camera = UsbCamera::new(provider, 0, Duration::from_millis(5));
        camera.start().unwrap();

        assert!(wait_for(Duration::from_secs(2), || camera.slot().has_frame()));
        assert_eq!(camera.state(), DriverState::Running);
        let frame = camera.slot().read_copy().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));

        camera.stop();
        assert_eq!(camera.state(), DriverState::Stopped);
        assert!(camera.join(Duration::from_secs(2)));
    }

    #[test]
    fn start_twice_is_a_noop() {
        let provider = Arc::new(PatternProvider::solid(8, 8, [1, 2, 3]));
        let camera = UsbCamera::new(provider.clone(), 0, Duration::from_millis(5));
        camera.start().unwrap();
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || camera.state()
            == DriverState::Running));
        assert_eq!(provider.opened(), 1);
        camera.stop();
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let provider = Arc::new(PatternProvider::solid(8, 8, [1, 2, 3]));
        let camera = UsbCamera::new(provider, 0, Duration::from_millis(5));
        camera.stop();
        camera.start().unwrap();
        camera.stop();
        camera.stop();
        assert_eq!(camera.state(), DriverState::Stopped);
        assert!(camera.join(Duration::from_secs(2)));
    }

    #[test]
    fn open_failure_leaves_driver_stopped() {
        let provider = Arc::new(PatternProvider::failing_open());
        let camera = UsbCamera::new(provider.clone(), 0, Duration::from_millis(5));
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || camera.state()
            == DriverState::Stopped));
        assert!(!camera.slot().has_frame());

        // A later start tries again.
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || provider.opened() == 2));
    }

    #[test]
    fn transient_read_failures_are_skipped() {
        let provider = Arc::new(PatternProvider::solid(8, 8, [9, 9, 9]).failing_every(2));
        let camera = UsbCamera::new(provider, 0, Duration::from_millis(1));
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || camera
            .slot()
            .stats()
            .frames_written
            >= 3));
        assert_eq!(camera.state(), DriverState::Running);
        camera.stop();
    }

    /// Tracks how many devices are open at once.
    #[derive(Default)]
    struct ExclusiveProvider {
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct ExclusiveDevice {
        live: Arc<AtomicUsize>,
    }

    impl VideoDeviceProvider for ExclusiveProvider {
        fn open(&self, _index: usize) -> Result<Box<dyn VideoDevice>, CameraError> {
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(ExclusiveDevice {
                live: self.live.clone(),
            }))
        }
    }

    impl VideoDevice for ExclusiveDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame::solid_rgb(8, 8, [4, 5, 6], 0))
        }
    }

    impl Drop for ExclusiveDevice {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_interrupts_the_poll_wait() {
        let provider = Arc::new(ExclusiveProvider::default());
        let camera = UsbCamera::new(provider.clone(), 0, Duration::from_secs(5));
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || camera.slot().has_frame()));

        let started = Instant::now();
        camera.stop();
        assert!(camera.join(Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(provider.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_never_opens_the_device_twice() {
        let provider = Arc::new(ExclusiveProvider::default());
        let camera = UsbCamera::new(provider.clone(), 0, Duration::from_millis(300));

        for _ in 0..3 {
            camera.start().unwrap();
            assert!(wait_for(Duration::from_secs(2), || camera.state()
                == DriverState::Running));
            thread::sleep(Duration::from_millis(50));
            camera.stop();
        }
        camera.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || camera.state()
            == DriverState::Running));

        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
        camera.stop();
        assert!(camera.join(Duration::from_secs(2)));
        assert_eq!(provider.live.load(Ordering::SeqCst), 0);
    }
}
