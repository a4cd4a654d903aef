//! Integration tests for the Device lifecycle
//!
//! Runs Devices against the in-memory transport with a live event pump:
//! - construction sequence and degraded construction
//! - inbound frames flowing through the consumer to the echo processor
//! - teardown ordering, idempotence and late completions

use common::{Direction, Frame};
use host::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockBackend, MockDevice, MockIo, create_mock_device, wait_until,
};
use host::usb::{
    Device, DeviceParams, DeviceState, EchoProcessor, EventPump, FrameProcessor, UsbBackend,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    backend: Arc<MockBackend>,
    _pump: EventPump<MockBackend>,
}

impl Harness {
    fn new() -> Self {
        let backend = Arc::new(MockBackend::new());
        let pump = EventPump::start(Arc::clone(&backend), Duration::from_millis(10)).unwrap();
        Self {
            backend,
            _pump: pump,
        }
    }

    fn open(&self, device: MockDevice) -> (Device, Arc<MockIo>) {
        self.open_with(device, &params(), Arc::new(EchoProcessor))
    }

    fn open_with(
        &self,
        device: MockDevice,
        params: &DeviceParams,
        processor: Arc<dyn FrameProcessor>,
    ) -> (Device, Arc<MockIo>) {
        self.backend.plug(device.clone());
        let io = self.backend.open(&device).unwrap();
        let mock = self.backend.io(device.id).unwrap();
        (Device::open(device.id, io, params, processor), mock)
    }
}

fn params() -> DeviceParams {
    DeviceParams {
        teardown_timeout: Duration::from_secs(2),
        ..DeviceParams::default()
    }
}

/// Records every payload it sees, echoes nothing
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

impl FrameProcessor for Recorder {
    fn process(&self, frame: &Frame) -> Vec<Frame> {
        self.seen.lock().unwrap().push(frame.payload.clone());
        Vec::new()
    }
}

/// Panics on payloads starting with 0xFF
struct Fragile;

impl FrameProcessor for Fragile {
    fn process(&self, frame: &Frame) -> Vec<Frame> {
        if frame.payload.first() == Some(&0xFF) {
            panic!("malformed frame");
        }
        EchoProcessor.process(frame)
    }
}

mod construction {
    use super::*;

    #[test]
    fn test_serial_parsed_and_device_active() {
        let harness = Harness::new();
        let (device, io) = harness.open(create_mock_device(1, "00000042"));

        assert_eq!(device.serial(), Some(42));
        assert_eq!(device.serial_string(), Some("00000042"));
        assert_eq!(device.state(), DeviceState::Active);
        assert!(!device.faults().any());
        assert_eq!(io.claimed(), vec![0]);
        assert_eq!(io.in_flight(Direction::In), 1);
    }

    #[test]
    fn test_handshake_sends_zeroed_buffer() {
        let harness = Harness::new();
        let (_device, io) = harness.open(create_mock_device(1, "00000042"));

        let submissions = io.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].endpoint, 0x01);
        assert_eq!(submissions[0].data, vec![0u8; 60]);
    }

    #[test]
    fn test_handshake_can_be_disabled() {
        let harness = Harness::new();
        let params = DeviceParams {
            handshake: false,
            ..params()
        };
        let (_device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params,
            Arc::new(EchoProcessor),
        );
        assert!(io.submissions().is_empty());
    }

    #[test]
    fn test_descriptor_fetch_retried_once() {
        let harness = Harness::new();
        let (device, io) =
            harness.open(create_mock_device(1, "00000042").with_descriptor_failures(1));

        assert_eq!(io.descriptor_calls(), 2);
        assert_eq!(device.serial(), Some(42));
        assert!(!device.faults().descriptor);
    }

    #[test]
    fn test_descriptor_failure_leaves_device_without_serial() {
        let harness = Harness::new();
        let (device, io) =
            harness.open(create_mock_device(1, "00000042").with_descriptor_failures(2));

        assert_eq!(io.descriptor_calls(), 2);
        assert_eq!(device.serial(), None);
        assert!(device.faults().descriptor);
        assert_eq!(io.in_flight(Direction::In), 0);
        assert!(io.submissions().is_empty());
        assert_eq!(device.state(), DeviceState::Active);
    }

    #[test]
    fn test_claim_failure_degrades_but_keeps_serving() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042").failing_claim());

        assert!(device.faults().interface_claim);
        assert_eq!(io.in_flight(Direction::In), 1);

        device.stop();
        // Never claimed, so never released
        assert!(io.released().is_empty());
    }

    #[test]
    fn test_non_numeric_serial() {
        let harness = Harness::new();
        let (device, _io) = harness.open(create_mock_device(1, "ABCDEFGH"));

        assert_eq!(device.serial(), None);
        assert_eq!(device.serial_string(), Some("ABCDEFGH"));
    }
}

mod echo {
    use super::*;

    #[test]
    fn test_inbound_frame_echoed_to_out_endpoint() {
        let harness = Harness::new();
        let (device, io) = harness.open(create_mock_device(1, "00000042"));

        assert!(io.complete_inbound(&[0x10, 0x20]));

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || io.submissions().len() == 2));
        let echo = &io.submissions()[1];
        assert_eq!(echo.endpoint, 0x01);
        assert_eq!(echo.data, vec![0x10, 0x20]);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.stats().frames_processed == 1
        }));
        assert_eq!(io.in_flight(Direction::In), 1);
    }

    #[test]
    fn test_frames_processed_in_arrival_order() {
        let harness = Harness::new();
        let recorder = Arc::new(Recorder::default());
        let (_device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params(),
            Arc::clone(&recorder) as Arc<dyn FrameProcessor>,
        );

        for payload in [[1u8], [2], [3], [4]] {
            assert!(io.complete_inbound(&payload));
        }

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || recorder.seen().len() == 4));
        assert_eq!(recorder.seen(), vec![vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_empty_frame_not_echoed() {
        let harness = Harness::new();
        let (device, io) = harness.open(create_mock_device(1, "00000042"));

        assert!(io.complete_inbound(&[]));

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.stats().frames_processed == 1
        }));
        assert_eq!(io.submissions().len(), 1);
    }

    #[test]
    fn test_processor_panic_does_not_stop_consumer() {
        let harness = Harness::new();
        let (device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params(),
            Arc::new(Fragile),
        );

        assert!(io.complete_inbound(&[0xFF]));
        assert!(io.complete_inbound(&[0x01]));

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            device.stats().frames_processed == 2
        }));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || io.submissions().len() == 2));
        assert_eq!(io.submissions()[1].data, vec![0x01]);
    }

    #[test]
    fn test_outbound_completion_frees_transfer() {
        let harness = Harness::new();
        let (device, io) = harness.open(create_mock_device(1, "00000042"));

        assert_eq!(io.complete_outbound(), 1);

        let stats = device.stats();
        assert_eq!(stats.outbound_completed, 1);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.frames_received, 0);
    }
}

mod teardown {
    use super::*;

    #[test]
    fn test_stop_cancels_in_flight_transfer_before_freeing() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042"));
        io.complete_outbound();
        let freed_before = device.stats().freed;

        device.stop();

        assert_eq!(device.state(), DeviceState::Stopped);
        assert_eq!(io.cancel_requests(), 1);
        assert_eq!(io.in_flight(Direction::In), 0);
        assert_eq!(device.stats().freed, freed_before + 1);
        assert_eq!(io.released(), vec![0]);
        // Nothing left for the transport to complete
        assert!(!io.complete_inbound(&[0x01]));
    }

    #[test]
    fn test_stop_cancels_unfinished_handshake() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042"));
        assert_eq!(device.info().outbound_in_flight, 1);

        device.stop();

        assert_eq!(io.in_flight(Direction::Out), 0);
        assert_eq!(io.in_flight(Direction::In), 0);
        assert!(device.outbound().is_empty());
        let stats = device.stats();
        assert_eq!(stats.freed, 2);
        assert_eq!(stats.outbound_retried, 0);
        assert_eq!(stats.outbound_completed, 0);
    }

    #[test]
    fn test_send_refused_after_stop() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042"));
        io.complete_outbound();

        device.stop();

        assert!(device.send(0x01, &[0x01]).is_err());
        assert_eq!(io.submissions().len(), 1);
        assert_eq!(io.in_flight(Direction::Out), 0);
    }

    #[test]
    fn test_unreturned_outbound_freed_by_late_completion() {
        let harness = Harness::new();
        let params = DeviceParams {
            teardown_timeout: Duration::from_millis(50),
            ..params()
        };
        let (mut device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params,
            Arc::new(EchoProcessor),
        );
        io.set_hold_cancellations(true);

        device.stop();
        assert_eq!(device.state(), DeviceState::Stopped);
        assert_eq!(device.outbound().len(), 1);

        assert!(io.complete_next(
            Direction::Out,
            host::usb::TransferStatus::Cancelled,
            &[]
        ));
        assert!(device.outbound().is_empty());
        assert_eq!(io.in_flight(Direction::Out), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042"));

        device.stop();
        let freed = device.stats().freed;
        device.stop();

        assert_eq!(device.stats().freed, freed);
        // Inbound transfer and handshake, once each
        assert_eq!(io.cancel_requests(), 2);
        assert_eq!(io.released(), vec![0]);
    }

    #[test]
    fn test_stop_after_device_gone_skips_cancel() {
        let harness = Harness::new();
        let (mut device, io) = harness.open(create_mock_device(1, "00000042"));

        harness.backend.unplug(device.native_id());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            !device.inbound().in_flight() && device.outbound().is_empty()
        }));

        device.stop();
        assert_eq!(io.cancel_requests(), 0);
        assert_eq!(device.state(), DeviceState::Stopped);
    }

    #[test]
    fn test_unreturned_transfer_freed_by_late_completion() {
        let harness = Harness::new();
        let params = DeviceParams {
            teardown_timeout: Duration::from_millis(50),
            handshake: false,
            ..params()
        };
        let (mut device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params,
            Arc::new(EchoProcessor),
        );
        io.set_hold_cancellations(true);

        device.stop();
        assert_eq!(device.state(), DeviceState::Stopped);
        assert_eq!(device.stats().freed, 0);

        // The transport finally hands it back: freed, not resubmitted
        assert!(io.complete_next(
            Direction::In,
            host::usb::TransferStatus::Cancelled,
            &[]
        ));
        assert_eq!(device.stats().freed, 1);
        assert_eq!(io.in_flight(Direction::In), 0);
    }

    #[test]
    fn test_completion_during_teardown_is_not_resubmitted() {
        let harness = Harness::new();
        let params = DeviceParams {
            teardown_timeout: Duration::from_millis(50),
            handshake: false,
            ..params()
        };
        let (mut device, io) = harness.open_with(
            create_mock_device(1, "00000042"),
            &params,
            Arc::new(EchoProcessor),
        );
        io.set_hold_cancellations(true);
        device.stop();

        // Data that raced the cancel is dropped with the descriptor
        assert!(io.complete_inbound(&[0x42]));
        assert_eq!(io.in_flight(Direction::In), 0);
        assert_eq!(device.stats().freed, 1);
    }

    #[test]
    fn test_drop_runs_teardown() {
        let harness = Harness::new();
        let (device, io) = harness.open(create_mock_device(1, "00000042"));

        drop(device);

        assert_eq!(io.released(), vec![0]);
        assert_eq!(io.in_flight(Direction::In), 0);
        assert_eq!(io.in_flight(Direction::Out), 0);
    }
}
