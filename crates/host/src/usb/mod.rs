//! USB subsystem
//!
//! Device discovery, per-device bulk transfer handling and the threads that
//! drive them:
//! - the event pump, which runs transport event processing and therefore
//!   every transfer completion
//! - the hotplug dispatcher, the only thread that creates or destroys Devices
//! - one inbound consumer per Device
//! - optionally the platform shim, when there is no native hotplug
//!
//! [`DeviceManager`] owns all of them.

pub mod completion;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod inbound;
pub mod libusb;
pub mod manager;
pub mod outbound;
pub mod pump;
pub mod queue;
pub mod shim;
pub mod transfer;
pub mod transport;

pub use device::{Device, DeviceFaults, DeviceInfo, DeviceParams, DeviceState, OutboundSender};
pub use error::TransportError;
pub use hotplug::{
    Dispatcher, EventOrigin, HotplugEvent, HotplugKind, HotplugQueue, HotplugSink, ManagerEvent,
    Registry,
};
pub use inbound::{EchoProcessor, FrameProcessor, InboundQueue, InboundRelease, InboundShared};
pub use libusb::LibusbBackend;
pub use manager::{DeviceManager, HotplugMode, ManagerConfig};
pub use outbound::OutboundSet;
pub use pump::EventPump;
pub use queue::WorkQueue;
pub use shim::{
    DevicePath, NotificationKind, PathError, PlatformShim, ShimFeed, ShimNotification,
    ShimSettings, parse_device_path,
};
pub use transfer::{Transfer, TransferId, TransferStats, TransferStatsSnapshot, TransferStatus};
pub use transport::{
    DescriptorInfo, DeviceIo, DeviceProbe, HotplugWatch, NativeId, SubmitError, UsbBackend,
};
