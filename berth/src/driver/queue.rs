//! Bounded accept queue.
//!
//! Decouples the context the stack accepts connections on from the poll
//! loop that assigns them slots. The producing side calls [`put`] and
//! returns immediately; the poll loop drains with [`get`] on its next
//! wake. Capacity is fixed at construction and overflow drops the new
//! handle silently, so a hostile burst of connections costs a bounded
//! amount of memory.
//!
//! [`put`]: AcceptQueue::put
//! [`get`]: AcceptQueue::get

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::stack::RawHandle;

/// Bounded FIFO of raw connection handles awaiting slot assignment.
///
/// Uses `RefCell` for single-threaded interior mutability; every
/// successful `put` pokes the shared scheduler notify so the poll loop
/// services the queue ahead of its next fixed interval.
#[derive(Debug)]
pub struct AcceptQueue {
    inner: RefCell<QueueInner>,
    notify: Rc<Notify>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    handles: VecDeque<RawHandle>,

    /// Handles accepted into the queue since construction.
    accepted: u64,

    /// Handles dropped against a full queue since construction.
    dropped: u64,
}

impl AcceptQueue {
    /// Create a queue holding at most `capacity` handles, waking `notify`
    /// on each successful put.
    pub fn new(capacity: usize, notify: Rc<Notify>) -> Self {
        Self {
            inner: RefCell::new(QueueInner::default()),
            notify,
            capacity,
        }
    }

    /// Offer a handle from the accepting context.
    ///
    /// Returns false when the queue is full: the handle is dropped and
    /// nothing is woken, so a burst beyond capacity leaves exactly
    /// `capacity` handles waiting.
    pub fn put(&self, handle: RawHandle) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.handles.len() >= self.capacity {
            inner.dropped += 1;
            tracing::debug!(%handle, capacity = self.capacity, "accept queue full, handle dropped");
            return false;
        }
        inner.handles.push_back(handle);
        inner.accepted += 1;
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Take the oldest waiting handle. Poll-loop side only.
    pub fn get(&self) -> Option<RawHandle> {
        self.inner.borrow_mut().handles.pop_front()
    }

    /// Handles currently waiting.
    pub fn available(&self) -> usize {
        self.inner.borrow().handles.len()
    }

    /// Total handles accepted into the queue.
    pub fn accepted(&self) -> u64 {
        self.inner.borrow().accepted
    }

    /// Total handles dropped against a full queue.
    pub fn dropped(&self) -> u64 {
        self.inner.borrow().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_queue(capacity: usize) -> (AcceptQueue, Rc<Notify>) {
        let notify = Rc::new(Notify::new());
        (AcceptQueue::new(capacity, notify.clone()), notify)
    }

    #[test]
    fn test_new_queue_is_empty() {
        let (queue, _notify) = create_test_queue(5);
        assert_eq!(queue.available(), 0);
        assert_eq!(queue.get(), None);
        assert_eq!(queue.accepted(), 0);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_fifo_ordering() {
        let (queue, _notify) = create_test_queue(5);
        assert!(queue.put(RawHandle(1)));
        assert!(queue.put(RawHandle(2)));
        assert!(queue.put(RawHandle(3)));

        assert_eq!(queue.get(), Some(RawHandle(1)));
        assert_eq!(queue.get(), Some(RawHandle(2)));
        assert_eq!(queue.get(), Some(RawHandle(3)));
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let (queue, _notify) = create_test_queue(5);
        for n in 1..=5 {
            assert!(queue.put(RawHandle(n)));
        }
        // sixth arrival bounces off the full queue
        assert!(!queue.put(RawHandle(6)));

        assert_eq!(queue.available(), 5);
        assert_eq!(queue.accepted(), 5);
        assert_eq!(queue.dropped(), 1);
        for n in 1..=5 {
            assert_eq!(queue.get(), Some(RawHandle(n)));
        }
    }

    #[test]
    fn test_drained_queue_accepts_again() {
        let (queue, _notify) = create_test_queue(2);
        assert!(queue.put(RawHandle(1)));
        assert!(queue.put(RawHandle(2)));
        assert!(!queue.put(RawHandle(3)));

        assert_eq!(queue.get(), Some(RawHandle(1)));
        assert!(queue.put(RawHandle(4)));
        assert_eq!(queue.available(), 2);
    }

    #[tokio::test]
    async fn test_put_wakes_scheduler() {
        let (queue, notify) = create_test_queue(5);
        queue.put(RawHandle(1));
        // the permit from put completes a later notified() immediately
        notify.notified().await;
    }

    #[tokio::test]
    async fn test_dropped_put_does_not_wake() {
        let (queue, notify) = create_test_queue(1);
        assert!(queue.put(RawHandle(1)));
        // consume the permit from the successful put
        notify.notified().await;

        assert!(!queue.put(RawHandle(2)));
        let woken = tokio::time::timeout(Duration::from_millis(20), notify.notified()).await;
        assert!(woken.is_err(), "drop must not wake the poll loop");
    }
}
