//! Test utilities for usb-echo-host
//!
//! An in-memory transport: [`MockBackend`] stands in for the libusb context
//! and [`MockIo`] for an opened handle. Submitted transfers stay "in flight"
//! inside the [`MockIo`] until a test completes them with a chosen status and
//! payload. Cancellations and device removal complete transfers
//! asynchronously from [`MockBackend::handle_events`], the way libusb does,
//! so a running [`EventPump`](crate::usb::EventPump) is needed to see them.
//!
//! # Example
//!
//! ```
//! use host::test_utils::{MockBackend, create_mock_device};
//! use host::usb::UsbBackend;
//!
//! let backend = MockBackend::new();
//! backend.plug(create_mock_device(1, "00000042"));
//! assert_eq!(backend.devices().unwrap().len(), 1);
//! ```

use crate::usb::completion;
use crate::usb::{
    DescriptorInfo, DeviceIo, DeviceProbe, HotplugSink, HotplugWatch, NativeId, SubmitError,
    Transfer, TransferId, TransferStatus, TransportError, UsbBackend,
};
use common::{Direction, UsbId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor/product pair of the mock devices
pub const MOCK_ID: UsbId = UsbId::new(0xDEAD, 0xBEEF);

const SERIAL_INDEX: u8 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `predicate` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Attached device as seen by the mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: NativeId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// `open()` and `probe()` fail with `Access`
    pub fail_open: bool,
    /// `claim_interface()` fails with `Busy`
    pub fail_claim: bool,
    /// Number of `device_descriptor()` calls that fail before one succeeds
    pub descriptor_failures: u32,
}

impl MockDevice {
    pub fn new(id: u64, vendor_id: u16, product_id: u16, serial: Option<&str>) -> Self {
        Self {
            id: NativeId(id),
            vendor_id,
            product_id,
            serial: serial.map(str::to_string),
            fail_open: false,
            fail_claim: false,
            descriptor_failures: 0,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_claim(mut self) -> Self {
        self.fail_claim = true;
        self
    }

    pub fn with_descriptor_failures(mut self, failures: u32) -> Self {
        self.descriptor_failures = failures;
        self
    }
}

/// Create a mock 0xDEAD/0xBEEF device with the given serial string
pub fn create_mock_device(id: u64, serial: &str) -> MockDevice {
    MockDevice::new(id, MOCK_ID.vendor_id, MOCK_ID.product_id, Some(serial))
}

#[derive(Default)]
struct Events {
    completions: VecDeque<(Box<Transfer>, TransferStatus)>,
    interrupted: bool,
}

/// Completions waiting for the next `handle_events` call
#[derive(Default)]
struct EventLoop {
    state: Mutex<Events>,
    ready: Condvar,
}

impl EventLoop {
    fn post(&self, transfer: Box<Transfer>, status: TransferStatus) {
        lock(&self.state).completions.push_back((transfer, status));
        self.ready.notify_all();
    }

    fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        self.ready.notify_all();
    }

    fn run(&self, timeout: Duration) -> Result<(), TransportError> {
        let state = lock(&self.state);
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| {
                s.completions.is_empty() && !s.interrupted
            })
            .unwrap_or_else(PoisonError::into_inner);
        let interrupted = std::mem::take(&mut state.interrupted);
        let completions = std::mem::take(&mut state.completions);
        drop(state);

        for (transfer, status) in completions {
            completion::complete(transfer, status);
        }
        if interrupted {
            Err(TransportError::Interrupted)
        } else {
            Ok(())
        }
    }
}

type HotplugSlot = Arc<Mutex<Option<(UsbId, HotplugSink<MockDevice>)>>>;

/// Deregisters the mock hotplug sink when dropped
struct MockRegistration {
    slot: HotplugSlot,
}

impl Drop for MockRegistration {
    fn drop(&mut self) {
        lock(&self.slot).take();
    }
}

pub struct MockBackend {
    attached: Mutex<Vec<MockDevice>>,
    hotplug: HotplugSlot,
    native_hotplug: bool,
    events: Arc<EventLoop>,
    ios: Mutex<HashMap<NativeId, Arc<MockIo>>>,
    handle_calls: AtomicU64,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend with native hotplug support
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Backend reporting `NotSupported` from `watch_hotplug`
    pub fn without_hotplug() -> Self {
        Self::build(false)
    }

    fn build(native_hotplug: bool) -> Self {
        Self {
            attached: Mutex::new(Vec::new()),
            hotplug: Arc::new(Mutex::new(None)),
            native_hotplug,
            events: Arc::new(EventLoop::default()),
            ios: Mutex::new(HashMap::new()),
            handle_calls: AtomicU64::new(0),
        }
    }

    /// Attach a device, firing a native arrival if hotplug is registered
    pub fn plug(&self, device: MockDevice) {
        lock(&self.attached).push(device.clone());
        if let Some((filter, sink)) = lock(&self.hotplug).as_ref()
            && filter.matches(device.vendor_id, device.product_id)
        {
            sink.arrived(device);
        }
    }

    /// Detach a device; its in-flight transfers complete with `NoDevice`
    pub fn unplug(&self, id: NativeId) -> Option<MockDevice> {
        let device = {
            let mut attached = lock(&self.attached);
            let pos = attached.iter().position(|d| d.id == id)?;
            attached.remove(pos)
        };
        if let Some(io) = lock(&self.ios).get(&id) {
            io.disconnect();
        }
        if let Some((filter, sink)) = lock(&self.hotplug).as_ref()
            && filter.matches(device.vendor_id, device.product_id)
        {
            sink.left(device.clone());
        }
        Some(device)
    }

    /// Most recently opened handle for a device
    pub fn io(&self, id: NativeId) -> Option<Arc<MockIo>> {
        lock(&self.ios).get(&id).cloned()
    }

    pub fn hotplug_registered(&self) -> bool {
        lock(&self.hotplug).is_some()
    }

    pub fn handle_event_calls(&self) -> u64 {
        self.handle_calls.load(Ordering::Relaxed)
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;

    fn device_id(&self, device: &MockDevice) -> NativeId {
        device.id
    }

    fn open(&self, device: &MockDevice) -> Result<Arc<dyn DeviceIo>, TransportError> {
        if device.fail_open {
            return Err(TransportError::Access);
        }
        let io = Arc::new(MockIo::new(device.clone(), Arc::clone(&self.events)));
        lock(&self.ios).insert(device.id, Arc::clone(&io));
        Ok(io)
    }

    fn devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        Ok(lock(&self.attached).clone())
    }

    fn probe(&self, device: &MockDevice) -> Result<DeviceProbe, TransportError> {
        if device.fail_open {
            return Err(TransportError::Access);
        }
        Ok(DeviceProbe {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            serial: device.serial.clone(),
        })
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        self.handle_calls.fetch_add(1, Ordering::Relaxed);
        self.events.run(timeout)
    }

    fn interrupt(&self) {
        self.events.interrupt();
    }

    fn watch_hotplug(
        &self,
        filter: UsbId,
        sink: HotplugSink<MockDevice>,
    ) -> Result<HotplugWatch, TransportError> {
        if !self.native_hotplug {
            return Err(TransportError::NotSupported);
        }
        for device in lock(&self.attached).iter() {
            if filter.matches(device.vendor_id, device.product_id) {
                sink.arrived(device.clone());
            }
        }
        *lock(&self.hotplug) = Some((filter, sink));
        Ok(HotplugWatch::new(MockRegistration {
            slot: Arc::clone(&self.hotplug),
        }))
    }
}

/// Outbound payload recorded at submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: TransferId,
    pub endpoint: u8,
    pub data: Vec<u8>,
}

pub struct MockIo {
    device: MockDevice,
    events: Arc<EventLoop>,
    in_flight: Mutex<Vec<Box<Transfer>>>,
    submissions: Mutex<Vec<Submission>>,
    claimed: Mutex<Vec<u8>>,
    released: Mutex<Vec<u8>>,
    descriptor_calls: AtomicU32,
    cancels: AtomicU32,
    fail_submit: AtomicBool,
    hold_cancellations: AtomicBool,
    gone: AtomicBool,
}

impl MockIo {
    fn new(device: MockDevice, events: Arc<EventLoop>) -> Self {
        Self {
            device,
            events,
            in_flight: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            claimed: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            descriptor_calls: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
            fail_submit: AtomicBool::new(false),
            hold_cancellations: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        }
    }

    fn disconnect(&self) {
        self.gone.store(true, Ordering::SeqCst);
        let transfers: Vec<_> = lock(&self.in_flight).drain(..).collect();
        for transfer in transfers {
            self.events.post(transfer, TransferStatus::NoDevice);
        }
    }

    fn take_next(&self, direction: Direction) -> Option<Box<Transfer>> {
        let mut in_flight = lock(&self.in_flight);
        let pos = in_flight.iter().position(|t| t.direction() == direction)?;
        Some(in_flight.remove(pos))
    }

    /// Finish the oldest in-flight transfer in `direction` on the calling
    /// thread
    ///
    /// Inbound transfers receive `data`; outbound ones report their whole
    /// buffer as written. Returns `false` if nothing was in flight.
    pub fn complete_next(&self, direction: Direction, status: TransferStatus, data: &[u8]) -> bool {
        let Some(mut transfer) = self.take_next(direction) else {
            return false;
        };
        match direction {
            Direction::In => {
                let len = data.len().min(transfer.length());
                transfer.buffer_mut()[..len].copy_from_slice(&data[..len]);
                transfer.set_actual_length(len);
            }
            Direction::Out => {
                let len = transfer.length();
                transfer.set_actual_length(len);
            }
        }
        completion::complete(transfer, status);
        true
    }

    /// Complete the inbound transfer with `data`
    pub fn complete_inbound(&self, data: &[u8]) -> bool {
        self.complete_next(Direction::In, TransferStatus::Completed, data)
    }

    /// Complete every in-flight outbound transfer successfully
    pub fn complete_outbound(&self) -> usize {
        let mut count = 0;
        while self.complete_next(Direction::Out, TransferStatus::Completed, &[]) {
            count += 1;
        }
        count
    }

    pub fn in_flight(&self, direction: Direction) -> usize {
        lock(&self.in_flight)
            .iter()
            .filter(|t| t.direction() == direction)
            .count()
    }

    /// Outbound submissions so far, oldest first
    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        lock(&self.claimed).clone()
    }

    pub fn released(&self) -> Vec<u8> {
        lock(&self.released).clone()
    }

    pub fn descriptor_calls(&self) -> u32 {
        self.descriptor_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_requests(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Make every following `submit()` fail with `Io`
    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Accept cancellation requests but never complete the transfers
    pub fn set_hold_cancellations(&self, hold: bool) {
        self.hold_cancellations.store(hold, Ordering::SeqCst);
    }
}

impl DeviceIo for MockIo {
    fn claim_interface(&self, iface: u8) -> Result<(), TransportError> {
        if self.device.fail_claim {
            return Err(TransportError::Busy);
        }
        lock(&self.claimed).push(iface);
        Ok(())
    }

    fn release_interface(&self, iface: u8) -> Result<(), TransportError> {
        lock(&self.released).push(iface);
        Ok(())
    }

    fn device_descriptor(&self) -> Result<DescriptorInfo, TransportError> {
        let calls = self.descriptor_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls <= self.device.descriptor_failures {
            return Err(TransportError::Io);
        }
        Ok(DescriptorInfo {
            vendor_id: self.device.vendor_id,
            product_id: self.device.product_id,
            serial_number_index: self.device.serial.as_ref().map(|_| SERIAL_INDEX),
        })
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        match (&self.device.serial, index) {
            (Some(serial), SERIAL_INDEX) => Ok(serial.clone()),
            _ => Err(TransportError::NotFound),
        }
    }

    fn submit(&self, transfer: Box<Transfer>) -> Result<(), SubmitError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(SubmitError {
                transfer,
                error: TransportError::NoDevice,
            });
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(SubmitError {
                transfer,
                error: TransportError::Io,
            });
        }
        if transfer.direction() == Direction::Out {
            lock(&self.submissions).push(Submission {
                id: transfer.id(),
                endpoint: transfer.endpoint(),
                data: transfer.buffer().to_vec(),
            });
        }
        lock(&self.in_flight).push(transfer);
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<(), TransportError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut in_flight = lock(&self.in_flight);
        let Some(pos) = in_flight.iter().position(|t| t.id() == id) else {
            return Err(TransportError::NotFound);
        };
        if self.hold_cancellations.load(Ordering::SeqCst) {
            return Ok(());
        }
        let transfer = in_flight.remove(pos);
        drop(in_flight);
        self.events.post(transfer, TransferStatus::Cancelled);
        Ok(())
    }
}
