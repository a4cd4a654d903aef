//! Transfer completion handler
//!
//! Invoked by the transport on the event-pump thread once per finished
//! transfer. The decision itself is a pure function of direction, status and
//! retry count ([`decide`]); [`complete`] carries it out. Nothing here
//! blocks beyond the short inbound-queue and slot locks, since a stalled
//! pump thread stalls every transfer in the process.

use crate::usb::outbound::OutboundSet;
use crate::usb::transfer::{Transfer, TransferRole, TransferStatus};
use common::{Direction, Frame};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// Outbound transfers get one resubmission after a transient failure
pub const OUTBOUND_MAX_RETRIES: u8 = 1;

/// What to do with a transfer the transport just handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Queue the received bytes as a frame, then resubmit
    DeliverAndResubmit,
    /// Resubmit the same descriptor and buffer without delivering anything
    Resubmit,
    /// Return the inbound descriptor to its Device without resubmitting
    Park,
    /// Outbound only: one more attempt with the same buffer
    Retry,
    /// Outbound only: release buffer and descriptor
    Free,
}

pub fn decide(direction: Direction, status: TransferStatus, retries: u8) -> Action {
    match (direction, status) {
        (Direction::In, TransferStatus::Completed) => Action::DeliverAndResubmit,
        (Direction::In, s) if s.is_transient() => Action::Resubmit,
        // NoDevice or Cancelled: the removal path tears the Device down
        (Direction::In, _) => Action::Park,

        (Direction::Out, TransferStatus::Completed) => Action::Free,
        (Direction::Out, s) if s.is_transient() && retries < OUTBOUND_MAX_RETRIES => {
            Action::Retry
        }
        (Direction::Out, _) => Action::Free,
    }
}

/// Entry point for transports: dispose of a transfer that reached `status`
///
/// The transport must already have recorded the actual length on the
/// descriptor with [`Transfer::set_actual_length`].
pub fn complete(transfer: Box<Transfer>, status: TransferStatus) {
    let action = decide(transfer.direction(), status, transfer.retries());
    trace!(
        "{} on endpoint {:#04x} finished with {:?} -> {:?}",
        transfer.id(),
        transfer.endpoint(),
        status,
        action
    );

    match transfer.role() {
        TransferRole::Inbound(shared) => {
            // Keep the shared state alive independently of the descriptor
            let shared = Arc::clone(shared);
            match action {
                Action::DeliverAndResubmit => {
                    let frame = Frame::new(transfer.endpoint(), transfer.received());
                    shared.deliver(frame, transfer.stats());
                    shared.resubmit(transfer);
                }
                Action::Resubmit => {
                    debug!(
                        "Receive transfer on endpoint {:#04x} reported {:?}, resubmitting",
                        transfer.endpoint(),
                        status
                    );
                    shared.resubmit(transfer);
                }
                _ => {
                    debug!(
                        "Receive transfer on endpoint {:#04x} stopped: {:?}",
                        transfer.endpoint(),
                        status
                    );
                    shared.park(transfer);
                }
            }
        }
        TransferRole::Outbound(set) => {
            let set = Arc::clone(set);
            match action {
                Action::Retry => retry_outbound(&set, transfer, status),
                _ => finish_outbound(transfer, status),
            }
        }
    }
}

fn retry_outbound(set: &OutboundSet, mut transfer: Box<Transfer>, status: TransferStatus) {
    let endpoint = transfer.endpoint();
    let stats = transfer.shared_stats();
    transfer.note_retry();
    match set.resubmit(transfer) {
        Ok(()) => {
            warn!(
                "Transmit on endpoint {:#04x} reported {:?}, retrying once",
                endpoint, status
            );
            stats.outbound_retried.fetch_add(1, Ordering::Relaxed);
        }
        Err((_transfer, None)) => {
            debug!(
                "Transmit on endpoint {:#04x} reported {:?} during teardown, not retrying",
                endpoint, status
            );
            stats.outbound_failed.fetch_add(1, Ordering::Relaxed);
        }
        Err((_transfer, Some(e))) => {
            error!("Transmit transfer error on endpoint {:#04x}: {}", endpoint, e);
            stats.outbound_retried.fetch_add(1, Ordering::Relaxed);
            stats.outbound_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn finish_outbound(transfer: Box<Transfer>, status: TransferStatus) {
    match status {
        TransferStatus::Completed => {
            trace!(
                "Transmitted {} bytes on endpoint {:#04x}",
                transfer.actual_length(),
                transfer.endpoint()
            );
            transfer.stats().outbound_completed.fetch_add(1, Ordering::Relaxed);
        }
        TransferStatus::Cancelled => {
            debug!("Transmit on endpoint {:#04x} cancelled", transfer.endpoint());
        }
        other => {
            warn!(
                "Transmit on endpoint {:#04x} gave up after {:?}",
                transfer.endpoint(),
                other
            );
            transfer.stats().outbound_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, MockIo, create_mock_device};
    use crate::usb::inbound::InboundShared;
    use crate::usb::outbound::OutboundSet;
    use crate::usb::transfer::TransferStats;
    use crate::usb::transport::{DeviceIo, UsbBackend};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(500);

    struct Fixture {
        _backend: MockBackend,
        io: Arc<dyn DeviceIo>,
        mock: Arc<MockIo>,
        shared: Arc<InboundShared>,
        outbound: Arc<OutboundSet>,
        stats: Arc<TransferStats>,
    }

    fn fixture() -> Fixture {
        let backend = MockBackend::new();
        let device = create_mock_device(1, "00000042");
        let io = backend.open(&device).unwrap();
        let mock = backend.io(device.id).unwrap();
        Fixture {
            _backend: backend,
            io,
            mock,
            shared: Arc::new(InboundShared::new()),
            outbound: Arc::new(OutboundSet::new()),
            stats: Arc::new(TransferStats::default()),
        }
    }

    fn start_inbound(f: &Fixture) {
        let transfer = Transfer::inbound(
            Arc::clone(&f.io),
            0x81,
            60,
            TIMEOUT,
            Arc::clone(&f.shared),
            Arc::clone(&f.stats),
        );
        f.shared.start(transfer).unwrap();
    }

    const TRANSIENT: [TransferStatus; 4] = [
        TransferStatus::Stall,
        TransferStatus::Overflow,
        TransferStatus::TimedOut,
        TransferStatus::Error,
    ];

    #[test]
    fn test_inbound_decisions() {
        assert_eq!(
            decide(Direction::In, TransferStatus::Completed, 0),
            Action::DeliverAndResubmit
        );
        for status in TRANSIENT {
            assert_eq!(decide(Direction::In, status, 0), Action::Resubmit);
            // Inbound never gives up on transient errors
            assert_eq!(decide(Direction::In, status, 5), Action::Resubmit);
        }
        assert_eq!(decide(Direction::In, TransferStatus::NoDevice, 0), Action::Park);
        assert_eq!(decide(Direction::In, TransferStatus::Cancelled, 0), Action::Park);
    }

    #[test]
    fn test_outbound_decisions() {
        assert_eq!(decide(Direction::Out, TransferStatus::Completed, 0), Action::Free);
        for status in TRANSIENT {
            assert_eq!(decide(Direction::Out, status, 0), Action::Retry);
            assert_eq!(decide(Direction::Out, status, 1), Action::Free);
        }
        assert_eq!(decide(Direction::Out, TransferStatus::Cancelled, 0), Action::Free);
        assert_eq!(decide(Direction::Out, TransferStatus::NoDevice, 0), Action::Free);
    }

    #[test]
    fn test_inbound_completion_enqueues_one_frame_and_resubmits() {
        let f = fixture();
        start_inbound(&f);
        assert_eq!(f.mock.in_flight(Direction::In), 1);

        assert!(f.mock.complete_inbound(&[0x10, 0x20]));

        assert_eq!(f.shared.queue().len(), 1);
        assert_eq!(f.mock.in_flight(Direction::In), 1);
        assert!(f.shared.in_flight());

        let frame = f.shared.queue().wait_batch().unwrap().pop_front().unwrap();
        assert_eq!(frame.to_wire(), vec![0x81, 0x10, 0x20]);

        let stats = f.stats.snapshot();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.inbound_resubmitted, 1);
        assert_eq!(stats.freed, 0);
    }

    #[test]
    fn test_inbound_transient_error_resubmits_without_frame() {
        let f = fixture();
        start_inbound(&f);

        for status in TRANSIENT {
            assert!(f.mock.complete_next(Direction::In, status, &[1, 2, 3]));

            assert!(f.shared.queue().is_empty(), "{:?} delivered a frame", status);
            assert_eq!(f.mock.in_flight(Direction::In), 1, "{:?} not resubmitted", status);
        }
        let stats = f.stats.snapshot();
        assert_eq!(stats.inbound_resubmitted, TRANSIENT.len() as u64);
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.freed, 0);
    }

    #[test]
    fn test_inbound_no_device_parks_transfer() {
        let f = fixture();
        start_inbound(&f);

        assert!(f.mock.complete_next(Direction::In, TransferStatus::NoDevice, &[]));

        assert_eq!(f.mock.in_flight(Direction::In), 0);
        assert!(!f.shared.in_flight());
        assert_eq!(f.stats.snapshot().freed, 0);

        // Teardown frees the parked descriptor without cancelling anything
        let release = f.shared.release(f.io.as_ref(), TIMEOUT);
        assert_eq!(release, crate::usb::inbound::InboundRelease::Freed);
        assert_eq!(f.mock.cancel_requests(), 0);
        assert_eq!(f.stats.snapshot().freed, 1);
    }

    #[test]
    fn test_failed_resubmission_parks_transfer() {
        let f = fixture();
        start_inbound(&f);
        f.mock.set_fail_submit(true);

        assert!(f.mock.complete_inbound(&[0xAA]));

        // The frame is still delivered; only the resubmission failed
        assert_eq!(f.shared.queue().len(), 1);
        assert!(!f.shared.in_flight());
        assert_eq!(f.stats.snapshot().freed, 0);
    }

    #[test]
    fn test_outbound_completion_frees_transfer() {
        let f = fixture();
        let transfer = Transfer::outbound(
            Arc::clone(&f.io),
            0x01,
            &[1, 2, 3],
            TIMEOUT,
            Arc::clone(&f.outbound),
            Arc::clone(&f.stats),
        );
        f.outbound.submit(transfer).unwrap();

        assert_eq!(f.mock.complete_outbound(), 1);

        assert!(f.shared.queue().is_empty());
        let stats = f.stats.snapshot();
        assert_eq!(stats.outbound_completed, 1);
        assert_eq!(stats.freed, 1);
    }

    #[test]
    fn test_outbound_retries_once_then_gives_up() {
        let f = fixture();
        let transfer = Transfer::outbound(
            Arc::clone(&f.io),
            0x01,
            &[9, 9],
            TIMEOUT,
            Arc::clone(&f.outbound),
            Arc::clone(&f.stats),
        );
        f.outbound.submit(transfer).unwrap();

        assert!(f.mock.complete_next(Direction::Out, TransferStatus::TimedOut, &[]));
        assert_eq!(f.mock.in_flight(Direction::Out), 1);
        assert_eq!(f.stats.snapshot().freed, 0);

        assert!(f.mock.complete_next(Direction::Out, TransferStatus::TimedOut, &[]));
        assert_eq!(f.mock.in_flight(Direction::Out), 0);

        let stats = f.stats.snapshot();
        assert_eq!(stats.outbound_retried, 1);
        assert_eq!(stats.outbound_failed, 1);
        assert_eq!(stats.freed, 1);
        // Both attempts carried the same payload
        let payloads: Vec<_> = f.mock.submissions().into_iter().map(|s| s.data).collect();
        assert_eq!(payloads, vec![vec![9, 9], vec![9, 9]]);
    }

    #[test]
    fn test_outbound_retry_submit_failure_frees() {
        let f = fixture();
        let transfer = Transfer::outbound(
            Arc::clone(&f.io),
            0x01,
            &[5],
            TIMEOUT,
            Arc::clone(&f.outbound),
            Arc::clone(&f.stats),
        );
        f.outbound.submit(transfer).unwrap();
        f.mock.set_fail_submit(true);

        assert!(f.mock.complete_next(Direction::Out, TransferStatus::Stall, &[]));

        let stats = f.stats.snapshot();
        assert_eq!(stats.outbound_failed, 1);
        assert_eq!(stats.freed, 1);
    }
}
