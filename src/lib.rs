pub mod app;
pub mod capture;
pub mod error;
pub mod gallery;
pub mod pipeline;
pub mod stage;
pub mod stream;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use error::ConfigError;
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "slidescan";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub preview: PreviewConfig,
    pub main: MainCameraConfig,
    pub snapshots: SnapshotConfig,
    pub stage: StageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PreviewBackend {
    V4l2,
    /// Generated test pattern, no hardware needed
    Pattern,
}

/// USB preview camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub backend: PreviewBackend,
    /// `None` auto-detects the first capture device
    pub device_index: Option<usize>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Sleep between device reads
    pub poll_interval_ms: u64,
    /// Encoder back-off while no frame is available
    pub idle_interval_ms: u64,
    pub jpeg_quality: u8,
}

/// Main (vendor SDK) camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainCameraConfig {
    pub vertical_flip: bool,
    /// Let the SDK drop pending frames instead of queueing them
    pub real_time: bool,
    pub idle_interval_ms: u64,
    pub jpeg_quality: u8,
    /// Frame period of the simulated SDK
    pub simulated_frame_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub directory: PathBuf,
    pub jpeg_quality: u8,
}

/// Serial motion controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Explicit port; skips discovery when set
    pub port: Option<String>,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    /// Case-insensitive substrings matched against port descriptions
    pub port_keywords: Vec<String>,
    /// mm/min
    pub feed_rate: f64,
    /// mm
    pub default_step: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".into(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            backend: PreviewBackend::V4l2,
            device_index: None,
            width: 640,
            height: 480,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            poll_interval_ms: 50,
            idle_interval_ms: 100,
            jpeg_quality: 65,
        }
    }
}

impl Default for MainCameraConfig {
    fn default() -> Self {
        Self {
            vertical_flip: true,
            real_time: true,
            idle_interval_ms: 50,
            jpeg_quality: 70,
            simulated_frame_interval_ms: 40,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("snapshots"),
            jpeg_quality: 95,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            timeout_ms: 1000,
            port_keywords: vec![
                "arduino".into(),
                "ch340".into(),
                "usb serial".into(),
                "ftdi".into(),
            ],
            feed_rate: 1000.0,
            default_step: 1.0,
        }
    }
}

impl PreviewConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl MainCameraConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Loads defaults, then `path` (or `slidescan.toml` if present), then
    /// `SLIDESCAN__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(CONFIG_FILE).required(false),
        };
        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("SLIDESCAN")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stage.port_keywords"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, quality) in [
            ("preview.jpeg_quality", self.preview.jpeg_quality),
            ("main.jpeg_quality", self.main.jpeg_quality),
            ("snapshots.jpeg_quality", self.snapshots.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within 1..=100, got {}",
                    name, quality
                )));
            }
        }
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(ConfigError::Invalid(
                "preview width/height must be non-zero".into(),
            ));
        }
        if self.stage.baud_rate == 0 {
            return Err(ConfigError::Invalid("stage.baud_rate must be non-zero".into()));
        }
        Ok(())
    }
}
