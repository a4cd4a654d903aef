//! Platform hotplug shim
//!
//! Used when the transport has no native hotplug. An OS-specific watcher
//! (outside this crate) pushes raw device-path notifications into a
//! [`ShimFeed`]; the shim thread parses the vendor id, product id and serial
//! out of the path, finds the matching device in the transport's device
//! list and posts the same [`HotplugEvent`](crate::usb::hotplug::HotplugEvent)
//! shape native hotplug would.
//!
//! Device paths use a fixed layout, for example
//! `\\?\USB#VID_DEAD&PID_BEEF#00000042#{a5dcbf10-6530-11d2-901f-00c04fb951ed}`:
//! "USB" at offset 0x04, the vendor id at 0x0C, the product id at 0x15 and
//! an 8-character serial at 0x1A.

use crate::usb::hotplug::{HotplugSink, SharedRegistry, lock_registry};
use crate::usb::transport::UsbBackend;
use common::{UsbId, parse_serial};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const SERIAL_LEN: usize = 8;

const USB_TAG_OFFSET: usize = 0x04;
const VENDOR_OFFSET: usize = 0x0C;
const PRODUCT_OFFSET: usize = 0x15;
const SERIAL_OFFSET: usize = 0x1A;
const MIN_PATH_LEN: usize = SERIAL_OFFSET + SERIAL_LEN;

const FEED_CAPACITY: usize = 64;
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("device path too short ({0} bytes)")]
    TooShort(usize),

    #[error("not a USB device path")]
    NotUsb,

    #[error("invalid vendor id in device path")]
    VendorId,

    #[error("invalid product id in device path")]
    ProductId,

    #[error("invalid serial number in device path")]
    Serial,
}

/// Identity extracted from an OS device path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath {
    pub vendor_id: u16,
    pub product_id: u16,
    /// The 8 serial characters exactly as they appear in the path
    pub serial: String,
}

impl DevicePath {
    pub fn id(&self) -> UsbId {
        UsbId::new(self.vendor_id, self.product_id)
    }

    pub fn serial_number(&self) -> Option<i32> {
        parse_serial(&self.serial)
    }
}

pub fn parse_device_path(path: &str) -> Result<DevicePath, PathError> {
    let bytes = path.as_bytes();
    if bytes.len() < MIN_PATH_LEN {
        return Err(PathError::TooShort(bytes.len()));
    }
    if !bytes[USB_TAG_OFFSET..USB_TAG_OFFSET + 3].eq_ignore_ascii_case(b"USB") {
        return Err(PathError::NotUsb);
    }

    let vendor_id =
        parse_hex16(&bytes[VENDOR_OFFSET..VENDOR_OFFSET + 4]).ok_or(PathError::VendorId)?;
    let product_id =
        parse_hex16(&bytes[PRODUCT_OFFSET..PRODUCT_OFFSET + 4]).ok_or(PathError::ProductId)?;
    let serial = std::str::from_utf8(&bytes[SERIAL_OFFSET..SERIAL_OFFSET + SERIAL_LEN])
        .map_err(|_| PathError::Serial)?;

    Ok(DevicePath {
        vendor_id,
        product_id,
        serial: serial.to_string(),
    })
}

fn parse_hex16(digits: &[u8]) -> Option<u16> {
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let s = std::str::from_utf8(digits).ok()?;
    u16::from_str_radix(s, 16).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Arrival,
    RemoveComplete,
}

/// One OS device notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimNotification {
    pub kind: NotificationKind,
    pub path: String,
}

/// Handle the OS watcher pushes notifications into
///
/// Never blocks the OS thread; notifications are dropped when the shim is
/// not running or has fallen too far behind.
#[derive(Debug, Clone)]
pub struct ShimFeed {
    tx: async_channel::Sender<ShimNotification>,
}

impl ShimFeed {
    pub fn notify(&self, notification: ShimNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping shim notification: {}", e);
                false
            }
        }
    }

    pub fn arrival(&self, path: impl Into<String>) -> bool {
        self.notify(ShimNotification {
            kind: NotificationKind::Arrival,
            path: path.into(),
        })
    }

    pub fn removal(&self, path: impl Into<String>) -> bool {
        self.notify(ShimNotification {
            kind: NotificationKind::RemoveComplete,
            path: path.into(),
        })
    }
}

pub(crate) fn feed_channel() -> (ShimFeed, async_channel::Receiver<ShimNotification>) {
    let (tx, rx) = async_channel::bounded(FEED_CAPACITY);
    (ShimFeed { tx }, rx)
}

/// Timing of the arrival search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimSettings {
    /// Wait before the first search; the transport may not list the device yet
    pub initial_delay: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ShimSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

pub struct PlatformShim<B: UsbBackend> {
    backend: Arc<B>,
    filter: UsbId,
    sink: HotplugSink<B::Device>,
    registry: SharedRegistry<B::Device>,
    settings: ShimSettings,
    running: Arc<AtomicBool>,
}

impl<B: UsbBackend> PlatformShim<B> {
    pub fn new(
        backend: Arc<B>,
        filter: UsbId,
        sink: HotplugSink<B::Device>,
        registry: SharedRegistry<B::Device>,
        settings: ShimSettings,
    ) -> Self {
        Self {
            backend,
            filter,
            sink,
            registry,
            settings,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Post an arrival for every attached device matching the filter
    pub fn enumerate_present(&self) -> usize {
        let devices = match self.backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return 0;
            }
        };

        let mut found = 0;
        for device in devices {
            match self.backend.probe(&device) {
                Ok(probe) if self.filter.matches(probe.vendor_id, probe.product_id) => {
                    if self.sink.arrived(device) {
                        found += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => trace!("Skipping device {}: {}", self.backend.device_id(&device), e),
            }
        }
        debug!("Enumeration found {} matching devices", found);
        found
    }

    /// One pass over the device list looking for `path`'s device
    pub fn find_device(&self, path: &DevicePath) -> Option<B::Device> {
        let devices = match self.backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return None;
            }
        };

        devices.into_iter().find(|device| {
            let Ok(probe) = self.backend.probe(device) else {
                return false;
            };
            probe.vendor_id == path.vendor_id
                && probe.product_id == path.product_id
                && probe.serial.as_deref().is_some_and(|s| {
                    s.len() == SERIAL_LEN && s.eq_ignore_ascii_case(&path.serial)
                })
        })
    }

    pub fn handle(&self, notification: &ShimNotification) {
        let path = match parse_device_path(&notification.path) {
            Ok(path) => path,
            Err(e) => {
                debug!("Ignoring device notification '{}': {}", notification.path, e);
                return;
            }
        };
        if !self.filter.matches(path.vendor_id, path.product_id) {
            trace!("Ignoring notification for {}", path.id());
            return;
        }

        match notification.kind {
            NotificationKind::Arrival => self.arrival(&path),
            NotificationKind::RemoveComplete => self.removal(&path),
        }
    }

    fn arrival(&self, path: &DevicePath) {
        if !self.sleep(self.settings.initial_delay) {
            return;
        }
        for attempt in 1..=self.settings.max_attempts {
            if let Some(device) = self.find_device(path) {
                debug!(
                    "Found {} serial {} after {} attempt(s)",
                    path.id(),
                    path.serial,
                    attempt
                );
                self.sink.arrived(device);
                return;
            }
            if attempt < self.settings.max_attempts && !self.sleep(self.settings.retry_interval) {
                return;
            }
        }
        warn!(
            "Device {} serial {} not found after {} attempts",
            path.id(),
            path.serial,
            self.settings.max_attempts
        );
    }

    fn removal(&self, path: &DevicePath) {
        let Some(serial) = path.serial_number() else {
            debug!("Removal of device with non-numeric serial {}", path.serial);
            return;
        };
        let native = lock_registry(&self.registry).native_for_serial(serial);
        match native {
            Some(device) => {
                self.sink.left(device);
            }
            None => debug!("Removal of unregistered serial {}", serial),
        }
    }

    /// Sleep unless stopped; returns `false` if the shim was stopped
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
        false
    }

    /// Enumerate attached devices, then serve notifications until stopped
    pub fn spawn(
        self,
        feed: async_channel::Receiver<ShimNotification>,
    ) -> std::io::Result<ShimThread> {
        let running = Arc::clone(&self.running);
        let stop_rx = feed.clone();
        let thread = std::thread::Builder::new()
            .name("usb-shim".to_string())
            .spawn(move || self.run(feed))?;
        Ok(ShimThread {
            running,
            feed: stop_rx,
            thread: Some(thread),
        })
    }

    fn run(self, feed: async_channel::Receiver<ShimNotification>) {
        info!("Platform hotplug shim started");
        self.enumerate_present();
        while let Ok(notification) = feed.recv_blocking() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.handle(&notification);
        }
        info!("Platform hotplug shim stopped");
    }
}

pub struct ShimThread {
    running: Arc<AtomicBool>,
    feed: async_channel::Receiver<ShimNotification>,
    thread: Option<JoinHandle<()>>,
}

impl ShimThread {
    /// Stop the shim and join its thread; idempotent
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.feed.close();
        if thread.join().is_err() {
            warn!("Platform hotplug shim thread panicked");
        }
    }
}

impl Drop for ShimThread {
    fn drop(&mut self) {
        self.stop();
    }
}
