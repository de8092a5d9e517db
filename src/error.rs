//! Error types for the camera, gallery, stage and configuration layers

use std::path::PathBuf;

/// Camera and acquisition errors
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("No camera device found")]
    NoDevice,

    #[error("Failed to open camera: {0}")]
    OpenFailed(String),

    #[error("Camera is not initialized")]
    NotInitialized,

    #[error("Camera is not running")]
    NotRunning,

    #[error("Invalid resolution index {index} ({available} available)")]
    InvalidResolution { index: usize, available: usize },

    #[error("SDK call {call} failed: {reason}")]
    Sdk { call: &'static str, reason: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Frame conversion failed: {0}")]
    Convert(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    pub fn sdk(call: &'static str, reason: impl ToString) -> Self {
        CameraError::Sdk {
            call,
            reason: reason.to_string(),
        }
    }
}

/// Snapshot and gallery errors
#[derive(Debug, thiserror::Error)]
pub enum GalleryError {
    #[error("Main camera is not available")]
    CameraUnavailable,

    #[error("No frame available to capture")]
    NoFrame,

    #[error("Failed to encode snapshot: {0}")]
    Encode(String),

    #[error("Not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CameraError> for GalleryError {
    fn from(err: CameraError) -> Self {
        GalleryError::Encode(err.to_string())
    }
}

/// Stage motion controller errors
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("No serial port matches any of {keywords:?}")]
    PortNotFound { keywords: Vec<String> },

    #[error("Stage is not connected")]
    NotConnected,

    #[error("Invalid jog: {0}")]
    InvalidJog(String),

    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
