//! Bounded inbound byte ring shared between a network stack and a slot.
//!
//! The ring is the only structure the stack's receive path and the poll
//! loop both touch: the stack appends through a [`ReadSink`], the
//! application drains through the owning slot. Capacity is fixed at
//! construction and overflow follows the configured
//! [`ReadOverflowPolicy`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::ReadOverflowPolicy;

/// Shared ownership of a slot's ring (slot side and stack side).
pub type SharedRing = Rc<RefCell<ByteRing>>;

/// Fixed-capacity FIFO byte buffer holding inbound data that the network
/// stack has delivered but the application has not yet consumed.
#[derive(Debug)]
pub struct ByteRing {
    bytes: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl ByteRing {
    /// Create a ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Create a ring already wrapped for sharing.
    pub fn shared(capacity: usize) -> SharedRing {
        Rc::new(RefCell::new(Self::new(capacity)))
    }

    /// Bytes currently waiting to be read.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Room left before the ring is full.
    pub fn free_space(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Append as much of `data` as fits, returning how many bytes were
    /// taken. Never evicts bytes already waiting.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.free_space());
        self.bytes.extend(&data[..take]);
        take
    }

    /// Record `count` arriving bytes as discarded.
    pub fn note_dropped(&mut self, count: usize) {
        self.dropped += count as u64;
    }

    /// Total bytes discarded on arrival since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Move waiting bytes into `out`, oldest first, returning the count.
    /// An empty ring yields 0.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let mut count = 0;
        while count < out.len() {
            match self.bytes.pop_front() {
                Some(byte) => {
                    out[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Discard everything waiting.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Producer side of a slot's read ring, handed to the network stack when a
/// connection is attached to a slot.
#[derive(Debug, Clone)]
pub struct ReadSink {
    ring: SharedRing,
    policy: ReadOverflowPolicy,
}

impl ReadSink {
    /// Wrap a ring with the configured overflow policy.
    pub fn new(ring: SharedRing, policy: ReadOverflowPolicy) -> Self {
        Self { ring, policy }
    }

    /// Offer arriving bytes, returning how many were consumed from `data`.
    ///
    /// Under [`ReadOverflowPolicy::DropNewest`] the whole slice is always
    /// consumed; bytes that did not fit are discarded and counted. Under
    /// [`ReadOverflowPolicy::Stall`] only what fits is consumed and the
    /// producer must hold the remainder until the application drains.
    pub fn deliver(&self, data: &[u8]) -> usize {
        let mut ring = self.ring.borrow_mut();
        let taken = ring.push_slice(data);
        match self.policy {
            ReadOverflowPolicy::DropNewest => {
                if taken < data.len() {
                    let lost = data.len() - taken;
                    ring.note_dropped(lost);
                    tracing::debug!(lost, "read ring full, newest bytes discarded");
                }
                data.len()
            }
            ReadOverflowPolicy::Stall => taken,
        }
    }

    /// Room currently available in the underlying ring.
    pub fn free_space(&self) -> usize {
        self.ring.borrow().free_space()
    }

    /// The overflow policy this sink applies.
    pub fn policy(&self) -> ReadOverflowPolicy {
        self.policy
    }
}
