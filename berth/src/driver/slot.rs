//! Per-slot connection state machine.
//!
//! A [`Slot`] owns everything one client connection needs between poll
//! ticks: the write-coalescing buffer, the shared inbound ring, the flush
//! countdown, and the per-write deadline. Slots are allocated once at
//! driver construction and reset in place on release.
//!
//! [`send_bounded`] is the one path bytes take to the stack: it chunks,
//! paces, and deadlines every transmission, whether the bytes came from a
//! coalescing buffer or a large direct write.

use std::time::Duration;

use crate::config::DriverConfig;
use crate::error::SocketError;
use crate::ring::{ByteRing, SharedRing};
use crate::stack::{MemoryKind, NetworkStack, RawHandle};
use crate::time::TimeProvider;

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No connection bound; claimable.
    Free,
    /// Handle bound; reads and writes permitted.
    Connected,
}

/// One pool entry.
#[derive(Debug)]
pub(crate) struct Slot {
    state: SlotState,
    handle: Option<RawHandle>,
    write_buffer: Vec<u8>,
    write_capacity: usize,
    read_ring: SharedRing,
    flush_countdown: u8,
    flush_delay_ticks: u8,
    write_timeout: Duration,
}

impl Slot {
    pub(crate) fn new(config: &DriverConfig) -> Self {
        Self {
            state: SlotState::Free,
            handle: None,
            write_buffer: Vec::with_capacity(config.write_buffer_size),
            write_capacity: config.write_buffer_size,
            read_ring: ByteRing::shared(config.read_buffer_size),
            flush_countdown: 0,
            flush_delay_ticks: config.flush_delay_ticks,
            write_timeout: config.write_timeout,
        }
    }

    pub(crate) fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.state == SlotState::Connected
    }

    /// Shared ring inbound bytes land in; cloned into the stack's sink.
    pub(crate) fn ring(&self) -> SharedRing {
        self.read_ring.clone()
    }

    /// Bind an accepted handle to this slot.
    pub(crate) fn connect(&mut self, handle: RawHandle) {
        self.handle = Some(handle);
        self.state = SlotState::Connected;
        self.flush_countdown = 0;
        // drop anything a stale reader delivered after the last release
        self.read_ring.borrow_mut().clear();
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub(crate) fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Append as much of `data` as fits in the coalescing buffer and
    /// return the count taken. Arms the flush countdown when bytes land
    /// in an idle buffer; an already-running countdown is left alone so a
    /// steady trickle of writes still flushes on schedule.
    pub(crate) fn coalesce(&mut self, data: &[u8]) -> usize {
        let room = self.write_capacity - self.write_buffer.len();
        let take = data.len().min(room);
        self.write_buffer.extend_from_slice(&data[..take]);
        if take > 0 && self.flush_countdown == 0 {
            self.flush_countdown = self.flush_delay_ticks;
        }
        take
    }

    pub(crate) fn unflushed_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Take the buffered bytes for sending, leaving the buffer empty.
    pub(crate) fn take_unflushed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_buffer)
    }

    /// Advance the flush countdown by one poll tick. Returns true when it
    /// just expired with bytes still buffered, i.e. a flush is due.
    pub(crate) fn tick_countdown(&mut self) -> bool {
        if self.state != SlotState::Connected || self.flush_countdown == 0 {
            return false;
        }
        self.flush_countdown -= 1;
        self.flush_countdown == 0 && !self.write_buffer.is_empty()
    }

    /// Move buffered inbound bytes into `out`, oldest first.
    pub(crate) fn read_into(&self, out: &mut [u8]) -> usize {
        self.read_ring.borrow_mut().drain_into(out)
    }

    pub(crate) fn read_available(&self) -> bool {
        !self.read_ring.borrow().is_empty()
    }

    /// Inbound bytes this slot's ring has discarded since construction.
    /// Survives release, so the tally is cumulative across connections.
    pub(crate) fn dropped_read_bytes(&self) -> u64 {
        self.read_ring.borrow().dropped()
    }

    /// Return the slot to `Free`, closing its connection at the stack.
    ///
    /// Unflushed bytes are discarded with a warning: close is the
    /// caller's statement that the connection is done, not a flush.
    pub(crate) fn release<S: NetworkStack>(&mut self, stack: &S) {
        if let Some(handle) = self.handle.take() {
            if !self.write_buffer.is_empty() {
                tracing::warn!(
                    %handle,
                    unflushed = self.write_buffer.len(),
                    "closing with unflushed bytes"
                );
            }
            stack.close(handle);
        }
        self.write_buffer.clear();
        self.read_ring.borrow_mut().clear();
        self.flush_countdown = 0;
        self.state = SlotState::Free;
    }
}

/// Transmit `data` on `handle` in bounded chunks.
///
/// Each pass sends at most `max_send_per_packet` bytes and only while the
/// stack's window covers a full chunk; a short window backs off for
/// `window_full_backoff` and a successful send yields for `send_backoff`
/// so sibling connections run between chunks. The whole loop is bounded
/// by `timeout` measured on the injected clock; a write that delivered
/// its last byte returns `Ok` even if the deadline passed during it.
pub(crate) async fn send_bounded<S, T>(
    stack: &S,
    time: &T,
    config: &DriverConfig,
    handle: RawHandle,
    data: &[u8],
    kind: MemoryKind,
    timeout: Duration,
) -> Result<(), SocketError>
where
    S: NetworkStack,
    T: TimeProvider,
{
    if data.is_empty() {
        return Ok(());
    }
    let started = time.now();
    let mut sent = 0;
    loop {
        if !stack.is_open(handle) {
            tracing::debug!(%handle, sent, "connection lost mid-write");
            return Err(SocketError::Failed);
        }
        let window = stack.send_window(handle);
        if window >= config.max_send_per_packet {
            let chunk = (data.len() - sent).min(config.max_send_per_packet);
            if let Err(err) = stack.send(handle, &data[sent..sent + chunk], kind).await {
                tracing::debug!(%handle, chunk, error = %err, "send refused");
                return Err(err.into());
            }
            sent += chunk;
            // yield after every send so sibling slots make progress
            time.sleep(config.send_backoff).await;
            if sent == data.len() {
                return Ok(());
            }
        } else {
            tracing::debug!(%handle, window, "send window short, backing off");
            time.sleep(config.window_full_backoff).await;
        }
        if time.now() - started >= timeout {
            tracing::warn!(%handle, sent, total = data.len(), "write timed out");
            return Err(SocketError::Timeout);
        }
    }
}
