//! Event pump thread
//!
//! Calls [`UsbBackend::handle_events`] in a loop; completion and native
//! hotplug callbacks run on this thread. A failed iteration is logged and the
//! loop carries on.

use crate::usb::error::TransportError;
use crate::usb::transport::UsbBackend;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct EventPump<B: UsbBackend> {
    backend: Arc<B>,
    running: Arc<AtomicBool>,
    iterations: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl<B: UsbBackend> EventPump<B> {
    /// Spawn the pump thread; each iteration waits at most `poll_interval`
    pub fn start(backend: Arc<B>, poll_interval: Duration) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let iterations = Arc::new(AtomicU64::new(0));

        let thread = {
            let backend = Arc::clone(&backend);
            let running = Arc::clone(&running);
            let iterations = Arc::clone(&iterations);
            std::thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || run(backend.as_ref(), &running, &iterations, poll_interval))?
        };

        Ok(Self {
            backend,
            running,
            iterations,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Completed `handle_events` calls so far
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Clear the running flag, wake the thread and join it; idempotent
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.backend.interrupt();
        if thread.join().is_err() {
            error!("USB event thread panicked");
        }
    }
}

impl<B: UsbBackend> Drop for EventPump<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<B: UsbBackend>(
    backend: &B,
    running: &AtomicBool,
    iterations: &AtomicU64,
    poll_interval: Duration,
) {
    info!("USB event thread started");
    while running.load(Ordering::SeqCst) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            backend.handle_events(poll_interval)
        }));
        iterations.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(Ok(())) => {}
            Ok(Err(TransportError::Interrupted)) => {
                debug!("USB event handling interrupted");
            }
            Ok(Err(e)) => {
                warn!("USB event handling error: {}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
            Err(e) => {
                error!("Panic in USB event handling: {:?}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    info!("USB event thread stopped");
}
