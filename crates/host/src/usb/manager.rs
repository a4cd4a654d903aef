//! Device manager
//!
//! Owns the hotplug queue, the registries, the event pump, the dispatcher
//! thread, the native hotplug registration and, on platforms without native
//! hotplug, the platform shim. `start()` brings them up; `stop()` tears them
//! down in an order where no completion can run against a destroyed Device:
//!
//! 1. drop the native hotplug registration and stop the shim (no new events)
//! 2. stop and join the dispatcher (no concurrent removal)
//! 3. tear down every registered Device while the pump is still running, so
//!    cancelled inbound transfers come back
//! 4. stop and join the pump

use crate::usb::device::{DeviceInfo, DeviceParams};
use crate::usb::error::TransportError;
use crate::usb::hotplug::{
    Dispatcher, EventOrigin, HotplugQueue, HotplugSink, ManagerEvent, Registry, SharedRegistry,
    lock_registry, spawn_dispatcher,
};
use crate::usb::inbound::{EchoProcessor, FrameProcessor};
use crate::usb::pump::EventPump;
use crate::usb::shim::{self, PlatformShim, ShimFeed, ShimNotification, ShimSettings, ShimThread};
use crate::usb::transport::{HotplugWatch, NativeId, UsbBackend};
use common::{Error, Result, UsbId};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Vendor/product pair this host claims
    pub filter: UsbId,
    pub device: DeviceParams,
    pub poll_interval: Duration,
    pub shim: ShimSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            filter: UsbId::new(0xDEAD, 0xBEEF),
            device: DeviceParams::default(),
            poll_interval: Duration::from_millis(100),
            shim: ShimSettings::default(),
        }
    }
}

/// How device arrivals are being detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugMode {
    Native,
    Shim,
}

pub struct DeviceManager<B: UsbBackend> {
    backend: Arc<B>,
    config: ManagerConfig,
    processor: Arc<dyn FrameProcessor>,
    queue: Arc<HotplugQueue<B::Device>>,
    registry: SharedRegistry<B::Device>,
    events_tx: async_channel::Sender<ManagerEvent>,
    events_rx: async_channel::Receiver<ManagerEvent>,
    shim_feed: ShimFeed,
    shim_rx: async_channel::Receiver<ShimNotification>,
    pump: Option<EventPump<B>>,
    dispatcher: Option<JoinHandle<()>>,
    watch: Option<HotplugWatch>,
    shim: Option<ShimThread>,
    mode: Option<HotplugMode>,
    stopped: bool,
}

impl<B: UsbBackend> DeviceManager<B> {
    pub fn new(backend: Arc<B>, config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let (shim_feed, shim_rx) = shim::feed_channel();
        Self {
            backend,
            config,
            processor: Arc::new(EchoProcessor),
            queue: Arc::new(HotplugQueue::new()),
            registry: Arc::new(Mutex::new(Registry::new())),
            events_tx,
            events_rx,
            shim_feed,
            shim_rx,
            pump: None,
            dispatcher: None,
            watch: None,
            shim: None,
            mode: None,
            stopped: false,
        }
    }

    /// Replace the echo processor; only effective before `start()`
    pub fn with_processor(mut self, processor: Arc<dyn FrameProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Start the dispatcher and pump, then register for hotplug
    ///
    /// Falls back to the platform shim when the transport reports no native
    /// hotplug support.
    pub fn start(&mut self) -> Result<HotplugMode> {
        if self.stopped {
            return Err(Error::Lifecycle("device manager already stopped"));
        }
        if let Some(mode) = self.mode {
            return Ok(mode);
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            self.config.device.clone(),
            Arc::clone(&self.processor),
            self.events_tx.clone(),
        );
        self.dispatcher = Some(spawn_dispatcher(dispatcher, Arc::clone(&self.queue))?);
        self.pump = Some(EventPump::start(
            Arc::clone(&self.backend),
            self.config.poll_interval,
        )?);

        let sink = HotplugSink::new(Arc::clone(&self.queue), EventOrigin::Native);
        let mode = match self.backend.watch_hotplug(self.config.filter, sink) {
            Ok(watch) => {
                info!("Native hotplug registered for {}", self.config.filter);
                self.watch = Some(watch);
                HotplugMode::Native
            }
            Err(TransportError::NotSupported) => {
                info!("Native hotplug not supported, starting platform shim");
                let shim = PlatformShim::new(
                    Arc::clone(&self.backend),
                    self.config.filter,
                    HotplugSink::new(Arc::clone(&self.queue), EventOrigin::Shim),
                    Arc::clone(&self.registry),
                    self.config.shim,
                );
                self.shim = Some(shim.spawn(self.shim_rx.clone())?);
                HotplugMode::Shim
            }
            Err(e) => {
                error!("Failed to register hotplug callback: {}", e);
                self.stop();
                return Err(e.into());
            }
        };

        self.mode = Some(mode);
        Ok(mode)
    }

    /// Shut everything down; idempotent
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        debug!("Stopping device manager");

        self.watch = None;
        if let Some(mut shim) = self.shim.take() {
            shim.stop();
        }
        self.shim_rx.close();

        let discarded = self.queue.stop();
        if discarded > 0 {
            debug!("Discarded {} pending hotplug events", discarded);
        }
        if let Some(handle) = self.dispatcher.take()
            && handle.join().is_err()
        {
            error!("Hotplug dispatcher thread panicked");
        }

        let devices = lock_registry(&self.registry).drain();
        if !devices.is_empty() {
            info!("Tearing down {} devices", devices.len());
        }
        for mut device in devices {
            device.stop();
        }

        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
        self.events_tx.close();
        info!("Device manager stopped");
    }

    pub fn mode(&self) -> Option<HotplugMode> {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.mode.is_some() && !self.stopped
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Receiver of manager events; every clone shares the same stream
    pub fn subscribe(&self) -> async_channel::Receiver<ManagerEvent> {
        self.events_rx.clone()
    }

    /// Where an OS device watcher delivers notifications for the shim
    pub fn shim_feed(&self) -> ShimFeed {
        self.shim_feed.clone()
    }

    /// Producer handle for injecting events from other sources
    pub fn hotplug_sink(&self, origin: EventOrigin) -> HotplugSink<B::Device> {
        HotplugSink::new(Arc::clone(&self.queue), origin)
    }

    pub fn device_by_serial(&self, serial: i32) -> Option<DeviceInfo> {
        lock_registry(&self.registry)
            .by_serial(serial)
            .map(|d| d.info())
    }

    pub fn device_by_native(&self, id: NativeId) -> Option<DeviceInfo> {
        lock_registry(&self.registry).by_native(id).map(|d| d.info())
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        lock_registry(&self.registry).infos()
    }

    pub fn device_count(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    /// Send `data` to a registered Device's OUT endpoint
    pub fn send(&self, serial: i32, endpoint: u8, data: &[u8]) -> Result<()> {
        let registry = lock_registry(&self.registry);
        let Some(device) = registry.by_serial(serial) else {
            warn!("No device with serial {}", serial);
            return Err(TransportError::NotFound.into());
        };
        device.send(endpoint, data).map_err(Into::into)
    }
}

impl<B: UsbBackend> Drop for DeviceManager<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
