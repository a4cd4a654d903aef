//! Hotplug event queue, device registries and dispatcher
//!
//! Producers (the native hotplug callback, the platform shim, start-up
//! enumeration) post [`HotplugEvent`]s through a [`HotplugSink`]. A single
//! dispatcher thread drains the queue in FIFO order and is the only writer of
//! the [`Registry`].

use crate::usb::device::{Device, DeviceInfo, DeviceParams};
use crate::usb::inbound::FrameProcessor;
use crate::usb::queue::WorkQueue;
use crate::usb::transport::{NativeId, UsbBackend};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotplugKind {
    Arrived,
    Left,
    /// Event code the dispatcher does not know; logged and ignored
    Other(u32),
}

/// Which producer posted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOrigin {
    Native,
    Shim,
    Enumeration,
}

#[derive(Debug, Clone)]
pub struct HotplugEvent<D> {
    pub kind: HotplugKind,
    pub origin: EventOrigin,
    pub device: D,
}

pub type HotplugQueue<D> = WorkQueue<HotplugEvent<D>>;

/// Producer handle onto the hotplug queue
pub struct HotplugSink<D> {
    queue: Arc<HotplugQueue<D>>,
    origin: EventOrigin,
}

impl<D> Clone for HotplugSink<D> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            origin: self.origin,
        }
    }
}

impl<D> HotplugSink<D> {
    pub fn new(queue: Arc<HotplugQueue<D>>, origin: EventOrigin) -> Self {
        Self { queue, origin }
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    /// Same queue, different origin tag
    pub fn with_origin(&self, origin: EventOrigin) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            origin,
        }
    }

    /// Returns `false` when the dispatcher has already been stopped
    pub fn post(&self, kind: HotplugKind, device: D) -> bool {
        let posted = self.queue.push(HotplugEvent {
            kind,
            origin: self.origin,
            device,
        });
        if !posted {
            debug!("Hotplug queue stopped, dropping {:?} event", kind);
        }
        posted
    }

    pub fn arrived(&self, device: D) -> bool {
        self.post(HotplugKind::Arrived, device)
    }

    pub fn left(&self, device: D) -> bool {
        self.post(HotplugKind::Left, device)
    }
}

/// Notifications published by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    DeviceAdded {
        native_id: NativeId,
        serial: Option<i32>,
    },
    DeviceRemoved {
        native_id: NativeId,
        serial: Option<i32>,
    },
    ArrivalRejected {
        native_id: NativeId,
        reason: String,
    },
}

struct Entry<D> {
    device: Device,
    native: D,
}

/// Live Devices keyed by native identity, plus a serial index
///
/// Devices without a numeric serial are only reachable by native identity.
/// When two attached devices share a serial the index points at the newest.
pub struct Registry<D> {
    by_native: HashMap<NativeId, Entry<D>>,
    by_serial: HashMap<i32, NativeId>,
}

impl<D> Default for Registry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Registry<D> {
    pub fn new() -> Self {
        Self {
            by_native: HashMap::new(),
            by_serial: HashMap::new(),
        }
    }

    pub fn insert(&mut self, native: D, device: Device) {
        let id = device.native_id();
        if let Some(serial) = device.serial()
            && let Some(previous) = self.by_serial.insert(serial, id)
            && previous != id
        {
            warn!(
                "Serial {} already registered for {}, now pointing at {}",
                serial, previous, id
            );
        }
        self.by_native.insert(id, Entry { device, native });
    }

    /// Remove a Device from both maps, handing back ownership
    pub fn remove(&mut self, id: NativeId) -> Option<(Device, D)> {
        let entry = self.by_native.remove(&id)?;
        if let Some(serial) = entry.device.serial()
            && self.by_serial.get(&serial) == Some(&id)
        {
            self.by_serial.remove(&serial);
        }
        Some((entry.device, entry.native))
    }

    pub fn contains_native(&self, id: NativeId) -> bool {
        self.by_native.contains_key(&id)
    }

    pub fn contains_serial(&self, serial: i32) -> bool {
        self.by_serial.contains_key(&serial)
    }

    pub fn by_native(&self, id: NativeId) -> Option<&Device> {
        self.by_native.get(&id).map(|e| &e.device)
    }

    pub fn by_serial(&self, serial: i32) -> Option<&Device> {
        let id = self.by_serial.get(&serial)?;
        self.by_native(*id)
    }

    pub fn len(&self) -> usize {
        self.by_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }

    pub fn infos(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<_> = self.by_native.values().map(|e| e.device.info()).collect();
        infos.sort_by_key(|i| i.native_id);
        infos
    }

    /// Empty both maps, returning every Device for teardown
    pub fn drain(&mut self) -> Vec<Device> {
        self.by_serial.clear();
        self.by_native.drain().map(|(_, e)| e.device).collect()
    }
}

impl<D: Clone> Registry<D> {
    /// Transport reference of the Device registered under `serial`
    pub fn native_for_serial(&self, serial: i32) -> Option<D> {
        let id = self.by_serial.get(&serial)?;
        self.by_native.get(id).map(|e| e.native.clone())
    }
}

pub type SharedRegistry<D> = Arc<Mutex<Registry<D>>>;

pub(crate) fn lock_registry<D>(registry: &Mutex<Registry<D>>) -> MutexGuard<'_, Registry<D>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer side of the hotplug queue
pub struct Dispatcher<B: UsbBackend> {
    backend: Arc<B>,
    registry: SharedRegistry<B::Device>,
    params: DeviceParams,
    processor: Arc<dyn FrameProcessor>,
    events: async_channel::Sender<ManagerEvent>,
}

impl<B: UsbBackend> Dispatcher<B> {
    pub fn new(
        backend: Arc<B>,
        registry: SharedRegistry<B::Device>,
        params: DeviceParams,
        processor: Arc<dyn FrameProcessor>,
        events: async_channel::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            backend,
            registry,
            params,
            processor,
            events,
        }
    }

    /// Process one event to completion
    pub fn handle(&self, event: HotplugEvent<B::Device>) {
        match event.kind {
            HotplugKind::Arrived => self.arrived(event.device, event.origin),
            HotplugKind::Left => self.left(event.device, event.origin),
            HotplugKind::Other(code) => {
                warn!("Unhandled hotplug event {} ({:?})", code, event.origin)
            }
        }
    }

    fn arrived(&self, native: B::Device, origin: EventOrigin) {
        let id = self.backend.device_id(&native);
        if lock_registry(&self.registry).contains_native(id) {
            debug!("Device {} already registered, ignoring arrival", id);
            return;
        }

        let io = match self.backend.open(&native) {
            Ok(io) => io,
            Err(e) => {
                warn!("Unable to open device {}: {}", id, e);
                self.publish(ManagerEvent::ArrivalRejected {
                    native_id: id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        info!("Device {} arrived ({:?})", id, origin);
        let device = Device::open(id, io, &self.params, Arc::clone(&self.processor));
        let serial = device.serial();
        if serial.is_none() {
            warn!(
                "Device {} has no numeric serial, registering by native identity only",
                id
            );
        }
        lock_registry(&self.registry).insert(native, device);
        self.publish(ManagerEvent::DeviceAdded {
            native_id: id,
            serial,
        });
    }

    fn left(&self, native: B::Device, origin: EventOrigin) {
        let id = self.backend.device_id(&native);
        // Teardown may block; do it outside the registry lock
        let removed = lock_registry(&self.registry).remove(id);
        let Some((mut device, _native)) = removed else {
            debug!("Removal of unknown device {} ({:?})", id, origin);
            return;
        };

        info!("Device {} left ({:?})", id, origin);
        let serial = device.serial();
        device.stop();
        drop(device);
        self.publish(ManagerEvent::DeviceRemoved {
            native_id: id,
            serial,
        });
    }

    fn publish(&self, event: ManagerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(event)) => {
                debug!("Manager event channel full, dropping {:?}", event)
            }
            Err(async_channel::TrySendError::Closed(_)) => {}
        }
    }

    /// Drain the queue until it is stopped
    pub fn run(self, queue: Arc<HotplugQueue<B::Device>>) {
        info!("Hotplug dispatcher started");
        while let Some(batch) = queue.wait_batch() {
            for event in batch {
                let kind = event.kind;
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.handle(event)));
                if let Err(e) = result {
                    error!("Panic while handling {:?} hotplug event: {:?}", kind, e);
                }
            }
        }
        info!("Hotplug dispatcher stopped");
    }
}

pub fn spawn_dispatcher<B: UsbBackend>(
    dispatcher: Dispatcher<B>,
    queue: Arc<HotplugQueue<B::Device>>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || dispatcher.run(queue))
}
