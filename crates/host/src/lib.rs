//! usb-echo-host library
//!
//! Claims every attached USB device with a configured vendor/product id,
//! keeps one bulk receive transfer in flight per device and hands received
//! frames to a [`usb::FrameProcessor`] on a per-device consumer thread. The
//! default processor echoes each payload back to the device.

pub mod config;
pub mod test_utils;
pub mod usb;

pub use config::HostConfig;
pub use usb::{DeviceManager, LibusbBackend};
