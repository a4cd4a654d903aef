//! Transport collaborator contract
//!
//! Everything that touches the underlying asynchronous USB library goes
//! through these two traits. [`UsbBackend`] is the library context (device
//! enumeration, opening, hotplug registration, event processing) and
//! [`DeviceIo`] is one opened device handle (interface claims, descriptors,
//! bulk transfer submission and cancellation).
//!
//! The production implementation lives in [`crate::usb::libusb`]; tests use
//! the in-memory transport from [`crate::test_utils`].

use crate::usb::error::TransportError;
use crate::usb::hotplug::HotplugSink;
use crate::usb::transfer::{Transfer, TransferId};
use common::UsbId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stable identity of a physical device while it stays attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(pub u64);

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev@{:x}", self.0)
    }
}

/// The parts of the device descriptor the host cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number_index: Option<u8>,
}

/// Identity read from an attached, not yet claimed device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProbe {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

impl DeviceProbe {
    pub fn id(&self) -> UsbId {
        UsbId::new(self.vendor_id, self.product_id)
    }
}

/// A rejected submission hands the descriptor back to the caller
pub struct SubmitError {
    pub transfer: Box<Transfer>,
    pub error: TransportError,
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("transfer", &self.transfer.id())
            .field("endpoint", &format_args!("{:#04x}", self.transfer.endpoint()))
            .field("error", &self.error)
            .finish()
    }
}

/// One opened device handle
///
/// The handle stays open for as long as any clone of the `Arc` lives. Every
/// in-flight transfer holds one, so a handle is never closed underneath a
/// transfer the transport still owns.
pub trait DeviceIo: Send + Sync {
    fn claim_interface(&self, iface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, iface: u8) -> Result<(), TransportError>;

    fn device_descriptor(&self) -> Result<DescriptorInfo, TransportError>;

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError>;

    /// Submit a bulk transfer
    ///
    /// On success the transport owns the descriptor until it reports a
    /// terminal status, at which point it must call
    /// [`crate::usb::completion::complete`] from its event-processing thread.
    fn submit(&self, transfer: Box<Transfer>) -> Result<(), SubmitError>;

    /// Request cancellation of an in-flight transfer
    ///
    /// Cancellation is asynchronous: the transfer completes later with
    /// `Cancelled` status on the event-processing thread. Returns `NotFound`
    /// when no transfer with this id is in flight.
    fn cancel(&self, id: TransferId) -> Result<(), TransportError>;
}

/// The transport library context
pub trait UsbBackend: Send + Sync + 'static {
    /// Transport-owned reference to an attached device
    type Device: Clone + Send + Sync + 'static;

    fn device_id(&self, device: &Self::Device) -> NativeId;

    fn open(&self, device: &Self::Device) -> Result<Arc<dyn DeviceIo>, TransportError>;

    /// Currently attached devices
    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Read vendor/product/serial without claiming the device
    fn probe(&self, device: &Self::Device) -> Result<DeviceProbe, TransportError>;

    /// Process pending transport events, waiting at most `timeout`
    ///
    /// Completion and hotplug callbacks fire from inside this call.
    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Wake a thread blocked in [`UsbBackend::handle_events`]
    fn interrupt(&self);

    /// Register for arrival/removal of devices matching `filter`
    ///
    /// Devices already attached are reported as arrivals. Returns
    /// `NotSupported` when the platform has no native hotplug.
    fn watch_hotplug(
        &self,
        filter: UsbId,
        sink: HotplugSink<Self::Device>,
    ) -> Result<HotplugWatch, TransportError>;
}

/// Keeps a hotplug registration alive; dropping it deregisters
pub struct HotplugWatch {
    _registration: Box<dyn Send>,
}

impl HotplugWatch {
    pub fn new<T: Send + 'static>(registration: T) -> Self {
        Self {
            _registration: Box::new(registration),
        }
    }
}

impl fmt::Debug for HotplugWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HotplugWatch")
    }
}
