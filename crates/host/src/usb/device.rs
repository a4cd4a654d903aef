//! Device lifecycle
//!
//! A [`Device`] is built on arrival and destroyed on removal or shutdown; it
//! never reconnects. Construction runs the Initializing sequence (claim
//! interface, fetch descriptor, parse serial, submit the inbound transfer,
//! start the consumer thread, send the handshake). Dropping the Device runs
//! teardown: stop the consumer, cancel and free the inbound transfer, cancel
//! whatever outbound transfers are still in flight, then release the
//! interface.
//!
//! Resource failures during construction are logged and leave the Device
//! degraded instead of aborting, see [`DeviceFaults`].

use crate::usb::error::TransportError;
use crate::usb::inbound::{FrameProcessor, InboundRelease, InboundShared};
use crate::usb::outbound::OutboundSet;
use crate::usb::transfer::{Transfer, TransferStats, TransferStatsSnapshot};
use crate::usb::transport::{DeviceIo, NativeId};
use common::{Frame, parse_serial};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Device lifecycle states; transitions are strictly linear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Initializing,
    Active,
    TearingDown,
    Stopped,
}

/// Static parameters every Device is opened with
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub interface: u8,
    pub in_endpoint: u8,
    pub out_endpoint: u8,
    /// Size of the inbound buffer and of the handshake payload
    pub buffer_size: usize,
    pub transfer_timeout: Duration,
    pub handshake: bool,
    /// How long teardown waits for the transport to return every transfer
    pub teardown_timeout: Duration,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            interface: 0,
            in_endpoint: 0x81,
            out_endpoint: 0x01,
            buffer_size: 60,
            transfer_timeout: Duration::from_millis(5000),
            handshake: true,
            teardown_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Which construction steps failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFaults {
    pub interface_claim: bool,
    /// Descriptor unreadable after one retry; the Device has no serial and
    /// no transfers
    pub descriptor: bool,
    pub serial_unreadable: bool,
    pub inbound_submit: bool,
    pub consumer_spawn: bool,
    pub handshake: bool,
}

impl DeviceFaults {
    pub fn any(&self) -> bool {
        self.interface_claim
            || self.descriptor
            || self.serial_unreadable
            || self.inbound_submit
            || self.consumer_spawn
            || self.handshake
    }
}

/// Submits outbound transfers for one Device
#[derive(Clone)]
pub struct OutboundSender {
    io: Arc<dyn DeviceIo>,
    timeout: Duration,
    set: Arc<OutboundSet>,
    stats: Arc<TransferStats>,
}

impl OutboundSender {
    fn new(io: Arc<dyn DeviceIo>, timeout: Duration, stats: Arc<TransferStats>) -> Self {
        Self {
            io,
            timeout,
            set: Arc::new(OutboundSet::new()),
            stats,
        }
    }

    /// Copy `data` into a fresh transfer and submit it to the OUT endpoint
    /// `endpoint & 0x7F`
    ///
    /// The completion handler frees the transfer once it finishes.
    pub fn send(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        let transfer = Transfer::outbound(
            Arc::clone(&self.io),
            endpoint & 0x7F,
            data,
            self.timeout,
            Arc::clone(&self.set),
            Arc::clone(&self.stats),
        );
        self.stats.outbound_submitted.fetch_add(1, Ordering::Relaxed);
        self.set.submit(transfer).map_err(|e| {
            self.stats.outbound_failed.fetch_add(1, Ordering::Relaxed);
            e.error
        })
    }
}

/// Point-in-time view of a Device, safe to hand to other threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub native_id: NativeId,
    pub serial: Option<i32>,
    pub serial_string: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub state: DeviceState,
    pub faults: DeviceFaults,
    pub inbound_in_flight: bool,
    pub outbound_in_flight: usize,
    pub queued_frames: usize,
    pub stats: TransferStatsSnapshot,
}

pub struct Device {
    native_id: NativeId,
    state: DeviceState,
    serial: Option<i32>,
    serial_string: Option<String>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    faults: DeviceFaults,
    interface_claimed: bool,
    params: DeviceParams,
    io: Arc<dyn DeviceIo>,
    inbound: Arc<InboundShared>,
    outbound: OutboundSender,
    stats: Arc<TransferStats>,
    consumer: Option<JoinHandle<()>>,
}

impl Device {
    /// Run the Initializing sequence against an opened handle
    pub fn open(
        native_id: NativeId,
        io: Arc<dyn DeviceIo>,
        params: &DeviceParams,
        processor: Arc<dyn FrameProcessor>,
    ) -> Self {
        let stats = Arc::new(TransferStats::default());
        let mut device = Self {
            native_id,
            state: DeviceState::Initializing,
            serial: None,
            serial_string: None,
            vendor_id: None,
            product_id: None,
            faults: DeviceFaults::default(),
            interface_claimed: false,
            params: params.clone(),
            io: Arc::clone(&io),
            inbound: Arc::new(InboundShared::new()),
            outbound: OutboundSender::new(io, params.transfer_timeout, Arc::clone(&stats)),
            stats,
            consumer: None,
        };
        device.initialize(processor);
        device.state = DeviceState::Active;

        if device.faults.any() {
            warn!(
                "Device {} active in degraded state: {:?}",
                device.native_id, device.faults
            );
        } else {
            info!(
                "Device {} active (serial {})",
                device.native_id,
                device.serial_string.as_deref().unwrap_or("-")
            );
        }
        device
    }

    fn initialize(&mut self, processor: Arc<dyn FrameProcessor>) {
        match self.io.claim_interface(self.params.interface) {
            Ok(()) => self.interface_claimed = true,
            Err(e) => {
                error!(
                    "Device {}: unable to claim interface {}: {}",
                    self.native_id, self.params.interface, e
                );
                self.faults.interface_claim = true;
            }
        }

        let descriptor = match self.io.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "Device {}: could not get device descriptor ({}), trying again",
                    self.native_id, e
                );
                match self.io.device_descriptor() {
                    Ok(d) => d,
                    Err(e) => {
                        error!(
                            "Device {}: could not get device descriptor: {}",
                            self.native_id, e
                        );
                        self.faults.descriptor = true;
                        return;
                    }
                }
            }
        };
        self.vendor_id = Some(descriptor.vendor_id);
        self.product_id = Some(descriptor.product_id);

        match descriptor.serial_number_index {
            Some(index) => match self.io.read_string_descriptor(index) {
                Ok(s) => {
                    self.serial = parse_serial(&s);
                    if self.serial.is_none() {
                        warn!(
                            "Device {}: serial number '{}' is not numeric",
                            self.native_id, s
                        );
                    }
                    self.serial_string = Some(s);
                }
                Err(e) => {
                    warn!(
                        "Device {}: could not read serial number: {}",
                        self.native_id, e
                    );
                    self.faults.serial_unreadable = true;
                }
            },
            None => debug!("Device {} has no serial number", self.native_id),
        }

        let transfer = Transfer::inbound(
            Arc::clone(&self.io),
            self.params.in_endpoint,
            self.params.buffer_size,
            self.params.transfer_timeout,
            Arc::clone(&self.inbound),
            Arc::clone(&self.stats),
        );
        if let Err(e) = self.inbound.start(transfer) {
            error!(
                "Device {}: failed to submit receive transfer on endpoint {:#04x}: {}",
                self.native_id, self.params.in_endpoint, e
            );
            self.faults.inbound_submit = true;
        }

        let inbound = Arc::clone(&self.inbound);
        let outbound = self.outbound.clone();
        let stats = Arc::clone(&self.stats);
        match std::thread::Builder::new()
            .name(format!("usb-rx-{:x}", self.native_id.0))
            .spawn(move || consume(&inbound, &outbound, processor.as_ref(), &stats))
        {
            Ok(handle) => self.consumer = Some(handle),
            Err(e) => {
                error!(
                    "Device {}: failed to start consumer thread: {}",
                    self.native_id, e
                );
                self.faults.consumer_spawn = true;
            }
        }

        if self.params.handshake {
            let hello = vec![0u8; self.params.buffer_size];
            if let Err(e) = self.outbound.send(self.params.out_endpoint, &hello) {
                warn!("Device {}: handshake failed: {}", self.native_id, e);
                self.faults.handshake = true;
            }
        }
    }

    pub fn native_id(&self) -> NativeId {
        self.native_id
    }

    /// Numeric serial, when the string descriptor parsed as a decimal integer
    pub fn serial(&self) -> Option<i32> {
        self.serial
    }

    pub fn serial_string(&self) -> Option<&str> {
        self.serial_string.as_deref()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn faults(&self) -> DeviceFaults {
        self.faults
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn inbound(&self) -> &Arc<InboundShared> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<OutboundSet> {
        &self.outbound.set
    }

    /// Send a frame out of the host on `endpoint`
    pub fn send(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        self.outbound.send(endpoint, data)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            native_id: self.native_id,
            serial: self.serial,
            serial_string: self.serial_string.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            state: self.state,
            faults: self.faults,
            inbound_in_flight: self.inbound.in_flight(),
            outbound_in_flight: self.outbound.set.len(),
            queued_frames: self.inbound.queue().len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Run teardown; idempotent
    ///
    /// The consumer is stopped before the inbound transfer is cancelled.
    /// Every transfer is confirmed returned (or handed over to the transport
    /// once `teardown_timeout` runs out) before the interface is released.
    pub fn stop(&mut self) {
        if matches!(self.state, DeviceState::TearingDown | DeviceState::Stopped) {
            return;
        }
        self.state = DeviceState::TearingDown;
        debug!("Tearing down device {}", self.native_id);
        let deadline = Instant::now() + self.params.teardown_timeout;

        let discarded = self.inbound.queue().stop();
        if discarded > 0 {
            debug!(
                "Device {}: discarded {} unprocessed frames",
                self.native_id, discarded
            );
        }
        if let Some(handle) = self.consumer.take()
            && handle.join().is_err()
        {
            error!("Device {}: consumer thread panicked", self.native_id);
        }

        match self
            .inbound
            .release(self.io.as_ref(), self.params.teardown_timeout)
        {
            InboundRelease::Freed => {
                debug!("Device {}: receive transfer freed", self.native_id)
            }
            InboundRelease::NotHeld => {}
            InboundRelease::Abandoned => error!(
                "Device {}: receive transfer still owned by the transport after {:?}",
                self.native_id, self.params.teardown_timeout
            ),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let abandoned = self.outbound.set.release(self.io.as_ref(), remaining);
        if abandoned > 0 {
            error!(
                "Device {}: {} outbound transfers still owned by the transport after {:?}",
                self.native_id, abandoned, self.params.teardown_timeout
            );
        }

        if self.interface_claimed {
            if let Err(e) = self.io.release_interface(self.params.interface) {
                debug!(
                    "Device {}: failed to release interface {}: {}",
                    self.native_id, self.params.interface, e
                );
            }
            self.interface_claimed = false;
        }

        self.state = DeviceState::Stopped;
        info!("Device {} stopped", self.native_id);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consumer loop: drain the inbound queue batch by batch until it is stopped
fn consume(
    inbound: &InboundShared,
    outbound: &OutboundSender,
    processor: &dyn FrameProcessor,
    stats: &TransferStats,
) {
    while let Some(batch) = inbound.queue().wait_batch() {
        for frame in batch {
            process_frame(&frame, outbound, processor);
            stats.frames_processed.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("Inbound consumer exiting");
}

fn process_frame(frame: &Frame, outbound: &OutboundSender, processor: &dyn FrameProcessor) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        processor.process(frame)
    }));
    let replies = match result {
        Ok(replies) => replies,
        Err(e) => {
            error!("Panic in frame processor: {:?}", e);
            return;
        }
    };

    for reply in replies {
        if let Err(e) = outbound.send(reply.endpoint, &reply.payload) {
            warn!(
                "Failed to send {} bytes on endpoint {:#04x}: {}",
                reply.payload.len(),
                reply.endpoint,
                e
            );
        }
    }
}
