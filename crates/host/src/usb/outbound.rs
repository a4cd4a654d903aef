//! In-flight outbound transfers of one Device
//!
//! Outbound descriptors are owned by the transport while in flight and are
//! freed by the completion handler, so the Device only keeps their ids.
//! Every submission and every retry goes through [`OutboundSet`] under its
//! lock, and so does teardown's cancel pass: once [`OutboundSet::release`]
//! has marked the set closing, no retry can slip a transfer back to the
//! transport behind the cancellations.
//!
//! Lock order: the set lock is taken before any transport lock, never
//! after. A descriptor's `Drop` takes the set lock, so no descriptor may be
//! dropped while it is held.

use crate::usb::error::TransportError;
use crate::usb::transfer::{Transfer, TransferId};
use crate::usb::transport::{DeviceIo, SubmitError};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct State {
    in_flight: HashSet<TransferId>,
    closing: bool,
}

#[derive(Default)]
pub struct OutboundSet {
    state: Mutex<State>,
    drained: Condvar,
}

impl OutboundSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of outbound transfers the transport currently holds
    pub fn len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submit a new outbound transfer, refusing once teardown has started
    pub(crate) fn submit(&self, transfer: Box<Transfer>) -> Result<(), SubmitError> {
        let mut state = self.lock();
        if state.closing {
            drop(state);
            return Err(SubmitError {
                transfer,
                error: TransportError::Other("device is shutting down".to_string()),
            });
        }
        let id = transfer.id();
        state.in_flight.insert(id);
        match transfer.submit() {
            Ok(()) => Ok(()),
            Err(e) => {
                state.in_flight.remove(&id);
                drop(state);
                Err(e)
            }
        }
    }

    /// Hand a transfer back to the transport for another attempt
    ///
    /// Returns the descriptor when it should be freed instead: teardown has
    /// started, or the resubmission failed (with the error).
    pub(crate) fn resubmit(
        &self,
        transfer: Box<Transfer>,
    ) -> Result<(), (Box<Transfer>, Option<TransportError>)> {
        let state = self.lock();
        if state.closing {
            drop(state);
            return Err((transfer, None));
        }
        // The id stays registered; the descriptor's drop unregisters it
        let result = transfer.submit();
        drop(state);
        result.map_err(|e| (e.transfer, Some(e.error)))
    }

    /// Called when an outbound descriptor is freed
    pub(crate) fn finished(&self, id: TransferId) {
        let mut state = self.lock();
        if state.in_flight.remove(&id) && state.in_flight.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Refuse new submissions, cancel everything in flight and wait up to
    /// `timeout` for the transport to hand it all back
    ///
    /// Returns the number of transfers still held by the transport; those
    /// are freed by the completion handler whenever they come back.
    pub fn release(&self, io: &dyn DeviceIo, timeout: Duration) -> usize {
        let mut state = self.lock();
        state.closing = true;
        for id in &state.in_flight {
            if let Err(e) = io.cancel(*id) {
                // Already finishing inside the transport
                debug!("Cancel of {} failed: {}", id, e);
            }
        }
        let (state, _) = self
            .drained
            .wait_timeout_while(state, timeout, |s| !s.in_flight.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, create_mock_device};
    use crate::usb::transfer::{TransferStats, TransferStatus};
    use crate::usb::transport::UsbBackend;
    use common::Direction;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn outbound(
        io: &Arc<dyn DeviceIo>,
        set: &Arc<OutboundSet>,
        stats: &Arc<TransferStats>,
    ) -> Box<Transfer> {
        Transfer::outbound(
            Arc::clone(io),
            0x01,
            &[1, 2],
            TIMEOUT,
            Arc::clone(set),
            Arc::clone(stats),
        )
    }

    #[test]
    fn test_completion_unregisters_transfer() {
        let backend = MockBackend::new();
        let device = create_mock_device(1, "00000042");
        let io = backend.open(&device).unwrap();
        let mock = backend.io(device.id).unwrap();
        let set = Arc::new(OutboundSet::new());
        let stats = Arc::new(TransferStats::default());

        set.submit(outbound(&io, &set, &stats)).unwrap();
        assert_eq!(set.len(), 1);

        assert_eq!(mock.complete_outbound(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_failed_submit_unregisters_transfer() {
        let backend = MockBackend::new();
        let device = create_mock_device(1, "00000042");
        let io = backend.open(&device).unwrap();
        let mock = backend.io(device.id).unwrap();
        let set = Arc::new(OutboundSet::new());
        let stats = Arc::new(TransferStats::default());
        mock.set_fail_submit(true);

        let err = set.submit(outbound(&io, &set, &stats)).unwrap_err();
        assert_eq!(err.error, TransportError::Io);
        drop(err);

        assert!(set.is_empty());
        assert_eq!(stats.snapshot().freed, 1);
    }

    #[test]
    fn test_release_refuses_new_submissions() {
        let backend = MockBackend::new();
        let device = create_mock_device(1, "00000042");
        let io = backend.open(&device).unwrap();
        let mock = backend.io(device.id).unwrap();
        let set = Arc::new(OutboundSet::new());
        let stats = Arc::new(TransferStats::default());

        assert_eq!(set.release(io.as_ref(), TIMEOUT), 0);

        assert!(set.submit(outbound(&io, &set, &stats)).is_err());
        assert_eq!(mock.in_flight(Direction::Out), 0);
        assert!(mock.submissions().is_empty());
    }

    #[test]
    fn test_release_times_out_on_unreturned_transfer() {
        let backend = MockBackend::new();
        let device = create_mock_device(1, "00000042");
        let io = backend.open(&device).unwrap();
        let mock = backend.io(device.id).unwrap();
        let set = Arc::new(OutboundSet::new());
        let stats = Arc::new(TransferStats::default());
        mock.set_hold_cancellations(true);
        set.submit(outbound(&io, &set, &stats)).unwrap();

        assert_eq!(set.release(io.as_ref(), Duration::from_millis(20)), 1);
        assert_eq!(mock.cancel_requests(), 1);

        // A transient failure after teardown started is not retried
        assert!(mock.complete_next(Direction::Out, TransferStatus::TimedOut, &[]));
        assert!(set.is_empty());
        assert_eq!(mock.in_flight(Direction::Out), 0);
        assert_eq!(stats.snapshot().outbound_retried, 0);
        assert_eq!(stats.snapshot().freed, 1);
    }
}
