pub mod convert;
pub mod frame;
pub mod sdk;
pub mod simulated;
pub mod usb;
pub mod v4l2;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use sdk::{CameraSdk, SdkCamera, SdkHandle};
pub use usb::{UsbCamera, VideoDevice, VideoDeviceProvider};
pub use v4l2::V4l2Provider;

use serde::Serialize;

/// Lifecycle of an acquisition driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Uninitialized,
    Initialized,
    Starting,
    Running,
    Stopped,
}
