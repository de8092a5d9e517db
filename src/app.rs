//! Application state shared by the HTTP handlers

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::sdk::{CameraInfo, FrameRateReport, SdkSettings};
use crate::capture::{CameraSdk, DriverState, SdkCamera, UsbCamera, VideoDeviceProvider};
use crate::error::{CameraError, GalleryError, StageError};
use crate::gallery::{Gallery, GalleryEntry, ImageRef, Snapshotter};
use crate::pipeline::SlotStats;
use crate::stage::{JogDirection, StageClient};
use crate::stream::encoder::StreamEncoder;
use crate::Config;

pub const ZOOM_MIN: f64 = 0.1;
pub const ZOOM_MAX: f64 = 5.0;
const ZOOM_DEFAULT_TENTHS: u32 = 10;

/// Both cameras plus gallery, stage and zoom
pub struct App {
    config: Config,
    preview: Arc<UsbCamera>,
    main: Arc<SdkCamera>,
    main_startup: Mutex<()>,
    main_error: Arc<ArcSwapOption<String>>,
    gallery: Gallery,
    snapshotter: Snapshotter,
    stage: Option<StageClient>,
    // Stored in tenths so it stays on the 0.1 grid
    zoom_tenths: AtomicU32,
}

#[derive(Debug, Serialize)]
pub struct PreviewStatus {
    pub state: DriverState,
    pub slot: SlotStats,
}

#[derive(Debug, Serialize)]
pub struct MainStatus {
    pub state: DriverState,
    pub frame_count: u64,
    pub frame_rate: Option<FrameRateReport>,
    pub last_error: Option<String>,
    pub slot: SlotStats,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub preview: PreviewStatus,
    pub main: MainStatus,
    pub gallery_entries: usize,
    pub zoom: f64,
    pub stage_port: Option<String>,
}

impl App {
    pub fn new(
        config: Config,
        preview_provider: Arc<dyn VideoDeviceProvider>,
        preview_index: usize,
        sdk: Arc<dyn CameraSdk>,
    ) -> Self {
        let preview = Arc::new(UsbCamera::new(
            preview_provider,
            preview_index,
            config.preview.poll_interval(),
        ));

        let main = Arc::new(SdkCamera::new(
            sdk,
            SdkSettings {
                vertical_flip: config.main.vertical_flip,
                real_time: config.main.real_time,
            },
        ));
        let main_error = Arc::new(ArcSwapOption::empty());
        let sink = main_error.clone();
        main.set_error_callback(move |msg| sink.store(Some(Arc::new(msg.to_string()))));
        main.set_fps_callback(|report| debug!("Main camera: {}", report));

        let snapshotter = Snapshotter::new(&config.snapshots.directory, config.snapshots.jpeg_quality)
            .with_source(main.slot().clone());

        Self {
            config,
            preview,
            main,
            main_startup: Mutex::new(()),
            main_error,
            gallery: Gallery::new(),
            snapshotter,
            stage: None,
            zoom_tenths: AtomicU32::new(ZOOM_DEFAULT_TENTHS),
        }
    }

    pub fn with_stage(mut self, stage: StageClient) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn main_camera(&self) -> &Arc<SdkCamera> {
        &self.main
    }

    /// Starts the preview driver unless it is already active.
    pub fn ensure_preview(&self) -> Result<(), CameraError> {
        if !self.preview.is_active() {
            self.preview.start()?;
        }
        Ok(())
    }

    /// Initializes and starts the main camera unless it is running.
    /// Blocks while the SDK opens the device.
    pub fn ensure_main(&self) -> Result<(), CameraError> {
        let _startup = self.main_startup.lock().unwrap_or_else(|e| e.into_inner());
        if self.main.is_running() {
            return Ok(());
        }
        self.main_error.store(None);
        self.main.initialize()?;
        self.main.start()
    }

    pub fn preview_encoder(&self) -> StreamEncoder {
        let cfg = &self.config.preview;
        StreamEncoder::new(
            "preview",
            self.preview.slot().clone(),
            cfg.jpeg_quality,
            cfg.idle_interval(),
        )
        .with_min_interval(cfg.poll_interval())
    }

    pub fn main_encoder(&self) -> StreamEncoder {
        let cfg = &self.config.main;
        StreamEncoder::new(
            "main",
            self.main.slot().clone(),
            cfg.jpeg_quality,
            cfg.idle_interval(),
        )
        .with_min_interval(Duration::from_millis(cfg.simulated_frame_interval_ms))
    }

    pub fn capture_snapshot(&self) -> Result<GalleryEntry, GalleryError> {
        if !self.main.is_running() && !self.main.slot().has_frame() {
            return Err(GalleryError::CameraUnavailable);
        }
        self.snapshotter.capture(&self.gallery)
    }

    pub fn import_image(&self, path: &Path) -> Result<GalleryEntry, GalleryError> {
        self.snapshotter.import(path, &self.gallery)
    }

    pub fn remove_image(&self, reference: &ImageRef) -> bool {
        let removed = self.gallery.remove(reference);
        if removed {
            info!("Removed gallery entry {:?}", reference);
        }
        removed
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn zoom(&self) -> f64 {
        self.zoom_tenths.load(Ordering::Relaxed) as f64 / 10.0
    }

    /// Rounds to the nearest 0.1 and clamps into [0.1, 5.0].
    pub fn set_zoom(&self, zoom: f64) -> f64 {
        let zoom = if zoom.is_finite() { zoom } else { 1.0 };
        let tenths = (zoom.clamp(ZOOM_MIN, ZOOM_MAX) * 10.0).round() as u32;
        self.zoom_tenths.store(tenths, Ordering::Relaxed);
        self.zoom()
    }

    pub fn camera_info(&self) -> Option<CameraInfo> {
        self.main.info()
    }

    pub fn set_resolution(&self, index: usize) -> Result<CameraInfo, CameraError> {
        self.main.set_resolution(index)?;
        self.main.info().ok_or(CameraError::NotInitialized)
    }

    pub fn snap(&self, index: usize) -> Result<(), CameraError> {
        self.main.snap(index)
    }

    /// Jogs the stage; `step` falls back to the configured default.
    pub fn jog(&self, direction: JogDirection, step: Option<f64>) -> Result<(), StageError> {
        let stage = self.stage.as_ref().ok_or(StageError::NotConnected)?;
        let step = step.unwrap_or(self.config.stage.default_step);
        stage.jog(direction, step, self.config.stage.feed_rate)
    }

    pub fn status(&self) -> Status {
        Status {
            preview: PreviewStatus {
                state: self.preview.state(),
                slot: self.preview.slot().stats(),
            },
            main: MainStatus {
                state: self.main.state(),
                frame_count: self.main.frame_count(),
                frame_rate: self.main.last_frame_rate(),
                last_error: self.main_error.load_full().map(|e| (*e).clone()),
                slot: self.main.slot().stats(),
            },
            gallery_entries: self.gallery.len(),
            zoom: self.zoom(),
            stage_port: self.stage.as_ref().map(|s| s.port_name().to_string()),
        }
    }

    /// Stops both cameras and waits briefly for the preview thread.
    pub fn shutdown(&self) {
        info!("Shutting down cameras");
        self.preview.stop();
        self.main.stop();
        if !self.preview.join(Duration::from_secs(2)) {
            warn!("Preview capture thread did not exit in time");
        }
    }
}
