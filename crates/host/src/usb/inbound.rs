//! Per-Device inbound pipeline
//!
//! [`InboundShared`] is the state the completion handler (event-pump thread)
//! and the Device's consumer thread share: the inbound frame queue and the
//! slot tracking who currently owns the Device's persistent inbound
//! transfer.
//!
//! The slot is a tagged ownership state. `Parked` means the Device holds the
//! descriptor and nobody else can touch its buffer; `InFlight` means the
//! transport owns it and only the completion handler will see it again.
//! Teardown flips the phase to `Closing` so a completing transfer is parked
//! instead of resubmitted, cancels whatever is in flight, waits for the
//! descriptor to come back and only then frees it.

use crate::usb::error::TransportError;
use crate::usb::queue::WorkQueue;
use crate::usb::transfer::{Transfer, TransferId, TransferStats};
use crate::usb::transport::DeviceIo;
use common::Frame;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Inbound queue of received frames
pub type InboundQueue = WorkQueue<Frame>;

/// Turns one received frame into outgoing frames
///
/// The endpoint of each returned frame is the destination endpoint.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, frame: &Frame) -> Vec<Frame>;
}

/// Placeholder policy: send every payload back out the matching OUT endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

impl FrameProcessor for EchoProcessor {
    fn process(&self, frame: &Frame) -> Vec<Frame> {
        if frame.payload.is_empty() {
            return Vec::new();
        }
        vec![Frame::new(frame.endpoint & 0x7F, frame.payload.clone())]
    }
}

enum SlotState {
    Empty,
    Parked(Box<Transfer>),
    InFlight(TransferId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct Slot {
    state: SlotState,
    phase: Phase,
}

/// How the inbound transfer was disposed of during teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRelease {
    /// Descriptor came back (or was already parked) and was freed
    Freed,
    /// Nothing to free: never allocated, or released by an earlier call
    NotHeld,
    /// The transport did not return the descriptor in time; it will be freed
    /// by the completion handler whenever the transport gives it back
    Abandoned,
}

pub struct InboundShared {
    queue: InboundQueue,
    slot: Mutex<Slot>,
    settled: Condvar,
}

impl Default for InboundShared {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundShared {
    pub fn new() -> Self {
        Self {
            queue: InboundQueue::new(),
            slot: Mutex::new(Slot {
                state: SlotState::Empty,
                phase: Phase::Open,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the inbound transfer is currently owned by the transport
    pub fn in_flight(&self) -> bool {
        matches!(self.lock().state, SlotState::InFlight(_))
    }

    /// Id of the in-flight inbound transfer, if any
    pub fn in_flight_id(&self) -> Option<TransferId> {
        match self.lock().state {
            SlotState::InFlight(id) => Some(id),
            _ => None,
        }
    }

    /// First submission of a freshly allocated inbound transfer
    pub(crate) fn start(&self, transfer: Box<Transfer>) -> Result<(), TransportError> {
        let mut slot = self.lock();
        let id = transfer.id();
        match transfer.submit() {
            Ok(()) => {
                slot.state = SlotState::InFlight(id);
                Ok(())
            }
            Err(e) => {
                slot.state = SlotState::Parked(e.transfer);
                Err(e.error)
            }
        }
    }

    /// Queue a received frame for the consumer
    pub(crate) fn deliver(&self, frame: Frame, stats: &TransferStats) {
        trace!(
            "Received {} bytes on endpoint {:#04x}",
            frame.payload.len(),
            frame.endpoint
        );
        stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if !self.queue.push(frame) {
            debug!("Inbound queue stopped, dropping frame");
        }
    }

    /// Resubmit after a completion, unless the Device is tearing down
    pub(crate) fn resubmit(&self, transfer: Box<Transfer>) {
        let mut slot = self.lock();
        match slot.phase {
            Phase::Open => {}
            Phase::Closing => {
                slot.state = SlotState::Parked(transfer);
                self.settled.notify_all();
                return;
            }
            Phase::Closed => {
                drop(slot);
                debug!("Late inbound completion after teardown, freeing {}", transfer.id());
                return;
            }
        }

        let id = transfer.id();
        transfer.stats().inbound_resubmitted.fetch_add(1, Ordering::Relaxed);
        match transfer.submit() {
            Ok(()) => slot.state = SlotState::InFlight(id),
            Err(e) => {
                error!(
                    "Re-issue receive transfer on endpoint {:#04x} failed: {}",
                    e.transfer.endpoint(),
                    e.error
                );
                slot.state = SlotState::Parked(e.transfer);
                self.settled.notify_all();
            }
        }
    }

    /// Give the descriptor back to the Device without resubmitting
    pub(crate) fn park(&self, transfer: Box<Transfer>) {
        let mut slot = self.lock();
        if slot.phase == Phase::Closed {
            drop(slot);
            debug!("Late inbound completion after teardown, freeing {}", transfer.id());
            return;
        }
        slot.state = SlotState::Parked(transfer);
        self.settled.notify_all();
    }

    /// Cancel, await and free the inbound transfer
    ///
    /// Idempotent; later calls return [`InboundRelease::NotHeld`].
    pub fn release(&self, io: &dyn DeviceIo, timeout: Duration) -> InboundRelease {
        let mut slot = self.lock();
        if slot.phase == Phase::Closed {
            return InboundRelease::NotHeld;
        }
        slot.phase = Phase::Closing;

        let in_flight = match slot.state {
            SlotState::InFlight(id) => Some(id),
            _ => None,
        };
        if let Some(id) = in_flight {
            drop(slot);
            debug!("Cancelling receive transfer {}", id);
            match io.cancel(id) {
                Ok(()) => {}
                // Already completing on the pump thread; it will be parked
                Err(TransportError::NotFound) => {}
                Err(e) => warn!("Failed to cancel receive transfer {}: {}", id, e),
            }

            slot = self.lock();
            let (guard, wait) = self
                .settled
                .wait_timeout_while(slot, timeout, |s| {
                    matches!(s.state, SlotState::InFlight(_))
                })
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;

            if wait.timed_out() && matches!(slot.state, SlotState::InFlight(_)) {
                slot.phase = Phase::Closed;
                warn!(
                    "Receive transfer {} not returned within {:?}, leaving it to the transport",
                    id, timeout
                );
                return InboundRelease::Abandoned;
            }
        }

        slot.phase = Phase::Closed;
        match std::mem::replace(&mut slot.state, SlotState::Empty) {
            SlotState::Parked(transfer) => {
                drop(slot);
                drop(transfer);
                InboundRelease::Freed
            }
            _ => InboundRelease::NotHeld,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_targets_out_endpoint() {
        let out = EchoProcessor.process(&Frame::new(0x81, vec![0x10, 0x20]));
        assert_eq!(out, vec![Frame::new(0x01, vec![0x10, 0x20])]);
    }

    #[test]
    fn test_echo_skips_empty_payload() {
        assert!(EchoProcessor.process(&Frame::new(0x82, Vec::new())).is_empty());
    }

    #[test]
    fn test_fresh_slot_has_nothing_to_release() {
        let shared = InboundShared::new();
        assert!(!shared.in_flight());
        assert_eq!(shared.in_flight_id(), None);
    }
}
