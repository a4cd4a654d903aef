//! libusb transport
//!
//! [`LibusbBackend`] wraps a `rusb::Context`; [`LibusbIo`] wraps an opened
//! handle and drives bulk transfers through the raw `rusb::ffi` asynchronous
//! API. Each submission allocates a `libusb_transfer`, points it at the
//! buffer of the boxed [`Transfer`] and leaks the box into `user_data`. The
//! completion callback (on the event pump thread, inside
//! `libusb_handle_events_timeout`) reclaims the box, frees the
//! `libusb_transfer` and hands the descriptor to
//! [`completion::complete`].
//!
//! In-flight `libusb_transfer` pointers are kept in a table keyed by
//! [`TransferId`]. Cancellation looks the pointer up under the table lock and
//! the callback removes its entry under the same lock before freeing, so a
//! cancel never touches a freed `libusb_transfer`.

use crate::usb::completion;
use crate::usb::error::TransportError;
use crate::usb::hotplug::HotplugSink;
use crate::usb::transfer::{Transfer, TransferId, TransferStatus};
use crate::usb::transport::{
    DescriptorInfo, DeviceIo, DeviceProbe, HotplugWatch, NativeId, SubmitError, UsbBackend,
};
use common::UsbId;
use common::logging::LIBUSB_TARGET;
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_context, libusb_free_transfer,
    libusb_set_log_cb, libusb_set_option, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, DeviceHandle, Hotplug, HotplugBuilder, UsbContext};
use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::ptr::{NonNull, null_mut};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

macro_rules! check {
    ($x:expr) => {
        // SAFETY: C API call
        match unsafe { $x } {
            LIBUSB_SUCCESS => Ok(()),
            e => Err(from_libusb(e)),
        }
    };
}

/// Converts a libusb return code to [`rusb::Error`]
const fn from_libusb(rc: c_int) -> rusb::Error {
    match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn map_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

/// libusb log level matching a tracing level name
pub fn libusb_log_level(level: &str) -> c_int {
    match level {
        "trace" => LIBUSB_LOG_LEVEL_DEBUG,
        "debug" => LIBUSB_LOG_LEVEL_INFO,
        "info" | "warn" => LIBUSB_LOG_LEVEL_WARNING,
        "error" => LIBUSB_LOG_LEVEL_ERROR,
        _ => LIBUSB_LOG_LEVEL_WARNING,
    }
}

/// Version banner and capability report, then route libusb logs to tracing
fn init_lib() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let v = rusb::version();
        info!(
            "libusb version: {}.{}.{}.{}{}",
            v.major(),
            v.minor(),
            v.micro(),
            v.nano(),
            v.rc().unwrap_or("")
        );
        debug!("- LIBUSB_CAP_HAS_CAPABILITY = {}", rusb::has_capability());
        debug!("- LIBUSB_CAP_HAS_HOTPLUG = {}", rusb::has_hotplug());
        debug!(
            "- LIBUSB_CAP_SUPPORTS_DETACH_KERNEL_DRIVER = {}",
            rusb::supports_detach_kernel_driver()
        );
        // SAFETY: C API call, a null context sets the global callback
        unsafe { libusb_set_log_cb(null_mut(), Some(log_cb), LIBUSB_LOG_CB_GLOBAL) };
    });
}

extern "system" fn log_cb(_: *mut libusb_context, lvl: c_int, msg: *mut c_void) {
    let r = std::panic::catch_unwind(|| {
        // SAFETY: msg is a valid C string
        let orig = unsafe { CStr::from_ptr(msg as *const c_char) }.to_string_lossy();
        let Some((_, msg)) = orig.as_ref().split_once("libusb: ") else {
            return;
        };
        let msg = msg.trim_end();
        match lvl {
            LIBUSB_LOG_LEVEL_ERROR => {
                error!(target: LIBUSB_TARGET, "{}", msg.trim_start_matches("error "))
            }
            LIBUSB_LOG_LEVEL_WARNING => {
                warn!(target: LIBUSB_TARGET, "{}", msg.trim_start_matches("warning "))
            }
            LIBUSB_LOG_LEVEL_INFO => {
                debug!(target: LIBUSB_TARGET, "{}", msg.trim_start_matches("info "))
            }
            _ => trace!(target: LIBUSB_TARGET, "{}", msg.trim_start_matches("debug ")),
        }
    });
    if let Err(e) = r {
        eprintln!("libusb log callback panic: {e:?}");
        std::process::abort();
    }
}

pub struct LibusbBackend {
    ctx: Context,
}

impl LibusbBackend {
    /// Create a libusb context logging at `log_level` (a `LIBUSB_LOG_LEVEL_*`)
    pub fn new(log_level: c_int) -> Result<Self, TransportError> {
        init_lib();
        let ctx = Context::new()?;
        check!(libusb_set_option(
            ctx.as_raw(),
            LIBUSB_OPTION_LOG_LEVEL,
            log_level
        ))?;
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl UsbBackend for LibusbBackend {
    type Device = rusb::Device<Context>;

    fn device_id(&self, device: &Self::Device) -> NativeId {
        NativeId(device.as_raw() as usize as u64)
    }

    fn open(&self, device: &Self::Device) -> Result<Arc<dyn DeviceIo>, TransportError> {
        let handle = device.open()?;
        Ok(Arc::new(LibusbIo::new(handle)))
    }

    fn devices(&self) -> Result<Vec<Self::Device>, TransportError> {
        Ok(self.ctx.devices()?.iter().collect())
    }

    fn probe(&self, device: &Self::Device) -> Result<DeviceProbe, TransportError> {
        let desc = device.device_descriptor()?;
        let serial = match desc.serial_number_string_index() {
            Some(index) => {
                let handle = device.open()?;
                handle.read_string_descriptor_ascii(index).ok()
            }
            None => None,
        };
        Ok(DeviceProbe {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            serial,
        })
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        self.ctx.handle_events(Some(timeout)).map_err(Into::into)
    }

    fn interrupt(&self) {
        self.ctx.interrupt_handle_events();
    }

    fn watch_hotplug(
        &self,
        filter: UsbId,
        sink: HotplugSink<Self::Device>,
    ) -> Result<HotplugWatch, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::NotSupported);
        }
        let registration = HotplugBuilder::new()
            .vendor_id(filter.vendor_id)
            .product_id(filter.product_id)
            .enumerate(true)
            .register(&self.ctx, Box::new(HotplugForwarder { sink }))?;
        Ok(HotplugWatch::new(registration))
    }
}

/// Posts libusb hotplug callbacks onto the hotplug queue
struct HotplugForwarder {
    sink: HotplugSink<rusb::Device<Context>>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        trace!("libusb arrival: {:?}", device);
        self.sink.arrived(device);
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        trace!("libusb removal: {:?}", device);
        self.sink.left(device);
    }
}

struct RawTransfer(NonNull<libusb_transfer>);

// SAFETY: the pointer is only dereferenced by libusb calls made under the
// in-flight table lock or by the completion callback that owns it
unsafe impl Send for RawTransfer {}

#[derive(Default)]
struct InFlight {
    table: Mutex<HashMap<TransferId, RawTransfer>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, RawTransfer>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What `user_data` points at while a transfer is with libusb
struct Pending {
    transfer: Box<Transfer>,
    in_flight: Arc<InFlight>,
}

pub struct LibusbIo {
    handle: DeviceHandle<Context>,
    in_flight: Arc<InFlight>,
}

impl LibusbIo {
    fn new(handle: DeviceHandle<Context>) -> Self {
        Self {
            handle,
            in_flight: Arc::new(InFlight::default()),
        }
    }
}

impl DeviceIo for LibusbIo {
    fn claim_interface(&self, iface: u8) -> Result<(), TransportError> {
        self.handle.claim_interface(iface).map_err(Into::into)
    }

    fn release_interface(&self, iface: u8) -> Result<(), TransportError> {
        self.handle.release_interface(iface).map_err(Into::into)
    }

    fn device_descriptor(&self) -> Result<DescriptorInfo, TransportError> {
        let desc = self.handle.device().device_descriptor()?;
        Ok(DescriptorInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            serial_number_index: desc.serial_number_string_index(),
        })
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        self.handle
            .read_string_descriptor_ascii(index)
            .map_err(Into::into)
    }

    fn submit(&self, mut transfer: Box<Transfer>) -> Result<(), SubmitError> {
        let Ok(length) = c_int::try_from(transfer.length()) else {
            return Err(SubmitError {
                transfer,
                error: TransportError::InvalidParam,
            });
        };
        // SAFETY: C API call
        let Some(raw) = NonNull::new(unsafe { libusb_alloc_transfer(0) }) else {
            return Err(SubmitError {
                transfer,
                error: TransportError::NoMem,
            });
        };

        let id = transfer.id();
        let endpoint = transfer.endpoint();
        let timeout = c_uint::try_from(transfer.timeout().as_millis()).unwrap_or(c_uint::MAX);
        // The Vec's heap allocation does not move with the box
        let buffer = transfer.buffer_mut().as_mut_ptr();
        let pending = Box::into_raw(Box::new(Pending {
            transfer,
            in_flight: Arc::clone(&self.in_flight),
        }));

        // SAFETY: raw was just allocated and is exclusively ours until submitted
        unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = self.handle.as_raw();
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*t).timeout = timeout;
            (*t).length = length;
            (*t).buffer = buffer;
            (*t).num_iso_packets = 0;
            (*t).callback = transfer_callback;
            (*t).user_data = pending.cast();
        }

        let mut table = self.in_flight.lock();
        match check!(libusb_submit_transfer(raw.as_ptr())) {
            Ok(()) => {
                table.insert(id, RawTransfer(raw));
                Ok(())
            }
            Err(e) => {
                drop(table);
                // SAFETY: submission failed, so libusb never took either pointer
                let pending = unsafe { Box::from_raw(pending) };
                unsafe { libusb_free_transfer(raw.as_ptr()) };
                Err(SubmitError {
                    transfer: pending.transfer,
                    error: e.into(),
                })
            }
        }
    }

    fn cancel(&self, id: TransferId) -> Result<(), TransportError> {
        let table = self.in_flight.lock();
        let Some(raw) = table.get(&id) else {
            return Err(TransportError::NotFound);
        };
        check!(libusb_cancel_transfer(raw.0.as_ptr())).map_err(Into::into)
    }
}

extern "system" fn transfer_callback(raw: *mut libusb_transfer) {
    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // SAFETY: user_data was set to a leaked Pending in submit(), and
        // libusb calls back exactly once per submission
        let (pending, status, actual_length) = unsafe {
            (
                Box::from_raw((*raw).user_data.cast::<Pending>()),
                (*raw).status,
                (*raw).actual_length,
            )
        };
        let Pending {
            mut transfer,
            in_flight,
        } = *pending;

        in_flight.lock().remove(&transfer.id());
        // SAFETY: no longer reachable through the in-flight table
        unsafe { libusb_free_transfer(raw) };

        transfer.set_actual_length(usize::try_from(actual_length).unwrap_or(0));
        completion::complete(transfer, map_status(status));
    }));
    if let Err(e) = r {
        eprintln!("libusb_transfer callback panic: {e:?}");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(map_status(LIBUSB_TRANSFER_COMPLETED), TransferStatus::Completed);
        assert_eq!(map_status(LIBUSB_TRANSFER_STALL), TransferStatus::Stall);
        assert_eq!(map_status(LIBUSB_TRANSFER_NO_DEVICE), TransferStatus::NoDevice);
        assert_eq!(map_status(LIBUSB_TRANSFER_CANCELLED), TransferStatus::Cancelled);
        assert_eq!(map_status(LIBUSB_TRANSFER_ERROR), TransferStatus::Error);
    }

    #[test]
    fn test_map_return_codes() {
        assert_eq!(from_libusb(LIBUSB_ERROR_NOT_FOUND), rusb::Error::NotFound);
        assert_eq!(from_libusb(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(from_libusb(-1234), rusb::Error::Other);
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(libusb_log_level("trace"), LIBUSB_LOG_LEVEL_DEBUG);
        assert_eq!(libusb_log_level("error"), LIBUSB_LOG_LEVEL_ERROR);
        assert_eq!(libusb_log_level("bogus"), LIBUSB_LOG_LEVEL_WARNING);
    }
}
