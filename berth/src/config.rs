//! Driver configuration.

use std::time::Duration;

/// Policy applied when inbound bytes arrive faster than the application
/// drains a slot's read ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOverflowPolicy {
    /// Bytes that do not fit in the ring are discarded and counted.
    DropNewest,
    /// Intake accepts only what fits; the stack stops pulling from the
    /// connection until the application drains the ring.
    Stall,
}

/// Tunables for the transport driver.
///
/// The defaults describe a small embedded deployment: three client slots,
/// a 128-byte write-coalescing buffer, a 1 KiB read ring, and at most 500
/// bytes handed to the network stack per send call.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Upper bound on bytes handed to the stack in a single send call.
    pub max_send_per_packet: usize,
    /// Capacity of the per-slot write-coalescing buffer.
    pub write_buffer_size: usize,
    /// Capacity of the per-slot read ring.
    pub read_buffer_size: usize,
    /// Number of client slots in the pool.
    pub max_concurrent_clients: usize,
    /// Initial per-slot write deadline. Every write replaces it with the
    /// deadline it was called with, and flushes reuse the latest value.
    pub write_timeout: Duration,
    /// Maximum number of concurrently registered listeners.
    pub max_listeners: usize,
    /// Depth of each listener's bounded accept queue.
    pub accept_queue_capacity: usize,
    /// Writes longer than this bypass the coalescing buffer and go straight
    /// through the bounded send loop.
    pub large_write_threshold: usize,
    /// Poll ticks a partially filled write buffer waits before it is
    /// force-flushed.
    pub flush_delay_ticks: u8,
    /// Fixed scheduler interval between poll ticks in [`run`].
    ///
    /// [`run`]: crate::driver::Driver::run
    pub poll_interval: Duration,
    /// Cooperative yield after every successful send call.
    pub send_backoff: Duration,
    /// Cooperative yield when the stack's send window is below
    /// `max_send_per_packet`.
    pub window_full_backoff: Duration,
    /// Interval between a listener's bind/listen retries after a failure.
    pub listener_retry_delay: Duration,
    /// Read-ring overflow behavior.
    pub read_overflow: ReadOverflowPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_send_per_packet: 500,
            write_buffer_size: 128,
            read_buffer_size: 1024,
            max_concurrent_clients: 3,
            write_timeout: Duration::from_millis(1000),
            max_listeners: 2,
            accept_queue_capacity: 5,
            large_write_threshold: 100,
            flush_delay_ticks: 3,
            poll_interval: Duration::from_millis(250),
            send_backoff: Duration::from_millis(20),
            window_full_backoff: Duration::from_millis(100),
            listener_retry_delay: Duration::from_secs(5),
            read_overflow: ReadOverflowPolicy::DropNewest,
        }
    }
}

impl DriverConfig {
    /// Configuration with every interval shrunk for fast local testing.
    pub fn fast_local() -> Self {
        Self {
            write_timeout: Duration::from_millis(250),
            poll_interval: Duration::from_millis(5),
            send_backoff: Duration::from_millis(1),
            window_full_backoff: Duration::from_millis(2),
            listener_retry_delay: Duration::from_millis(50),
            ..Self::default()
        }
    }
}
