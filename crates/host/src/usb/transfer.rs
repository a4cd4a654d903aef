//! Bulk transfer descriptors
//!
//! A [`Transfer`] owns its buffer. An inbound transfer is created once per
//! Device and cycles between the Device's inbound slot and the transport for
//! the whole Device lifetime, always against the same buffer. An outbound
//! transfer is created per send with a transient buffer and is dropped
//! (freed) exactly once, when the completion handler sees a terminal status.
//! Ownership of the `Box<Transfer>` is the state tag: whoever holds the box
//! may touch the buffer, and a transfer handed to the transport cannot be
//! freed by anybody else.

use crate::usb::inbound::InboundShared;
use crate::usb::outbound::OutboundSet;
use crate::usb::transport::{DeviceIo, SubmitError};
use common::Direction;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a transfer descriptor, stable across resubmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl TransferId {
    fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfr#{}", self.0)
    }
}

/// Status reported by the transport when a transfer finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Stall,
    Overflow,
    TimedOut,
    Error,
    NoDevice,
    Cancelled,
}

impl TransferStatus {
    /// Stall, overflow, timeout and generic errors are worth resubmitting
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransferStatus::Stall
                | TransferStatus::Overflow
                | TransferStatus::TimedOut
                | TransferStatus::Error
        )
    }
}

pub(crate) enum TransferRole {
    Inbound(Arc<InboundShared>),
    Outbound(Arc<OutboundSet>),
}

/// One bulk transfer descriptor and the buffer it exclusively owns
pub struct Transfer {
    id: TransferId,
    endpoint: u8,
    buffer: Vec<u8>,
    actual_length: usize,
    timeout: Duration,
    retries: u8,
    role: TransferRole,
    io: Arc<dyn DeviceIo>,
    stats: Arc<TransferStats>,
}

impl Transfer {
    /// Persistent inbound transfer with a zeroed receive buffer of `size` bytes
    pub(crate) fn inbound(
        io: Arc<dyn DeviceIo>,
        endpoint: u8,
        size: usize,
        timeout: Duration,
        shared: Arc<InboundShared>,
        stats: Arc<TransferStats>,
    ) -> Box<Self> {
        Box::new(Self {
            id: TransferId::next(),
            endpoint,
            buffer: vec![0u8; size],
            actual_length: 0,
            timeout,
            retries: 0,
            role: TransferRole::Inbound(shared),
            io,
            stats,
        })
    }

    /// Outbound transfer carrying a private copy of `data`
    pub(crate) fn outbound(
        io: Arc<dyn DeviceIo>,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
        set: Arc<OutboundSet>,
        stats: Arc<TransferStats>,
    ) -> Box<Self> {
        Box::new(Self {
            id: TransferId::next(),
            endpoint,
            buffer: data.to_vec(),
            actual_length: 0,
            timeout,
            retries: 0,
            role: TransferRole::Outbound(set),
            io,
            stats,
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        Direction::of(self.endpoint)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of bytes the transport should read or write
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    /// Whole buffer, for the transport to read into or write from
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Record how many bytes the transport moved, clamped to the buffer size
    pub fn set_actual_length(&mut self, len: usize) {
        self.actual_length = len.min(self.buffer.len());
    }

    /// The bytes received by the last completion
    pub fn received(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    pub(crate) fn retries(&self) -> u8 {
        self.retries
    }

    pub(crate) fn note_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub(crate) fn role(&self) -> &TransferRole {
        &self.role
    }

    pub(crate) fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub(crate) fn shared_stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Hand the descriptor to the transport it was created for
    pub fn submit(mut self: Box<Self>) -> Result<(), SubmitError> {
        self.actual_length = 0;
        let io = Arc::clone(&self.io);
        trace!(
            "Submitting {} on endpoint {:#04x} ({} bytes)",
            self.id,
            self.endpoint,
            self.buffer.len()
        );
        io.submit(self)
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("length", &self.buffer.len())
            .field("actual_length", &self.actual_length)
            .field("retries", &self.retries)
            .finish()
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        trace!("Freeing {} (endpoint {:#04x})", self.id, self.endpoint);
        self.stats.freed.fetch_add(1, Ordering::Relaxed);
        if let TransferRole::Outbound(set) = &self.role {
            set.finished(self.id);
        }
    }
}

/// Per-Device transfer counters
#[derive(Debug, Default)]
pub struct TransferStats {
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_processed: AtomicU64,
    pub(crate) inbound_resubmitted: AtomicU64,
    pub(crate) outbound_submitted: AtomicU64,
    pub(crate) outbound_completed: AtomicU64,
    pub(crate) outbound_retried: AtomicU64,
    pub(crate) outbound_failed: AtomicU64,
    pub(crate) freed: AtomicU64,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            inbound_resubmitted: self.inbound_resubmitted.load(Ordering::Relaxed),
            outbound_submitted: self.outbound_submitted.load(Ordering::Relaxed),
            outbound_completed: self.outbound_completed.load(Ordering::Relaxed),
            outbound_retried: self.outbound_retried.load(Ordering::Relaxed),
            outbound_failed: self.outbound_failed.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub inbound_resubmitted: u64,
    pub outbound_submitted: u64,
    pub outbound_completed: u64,
    pub outbound_retried: u64,
    pub outbound_failed: u64,
    pub freed: u64,
}
