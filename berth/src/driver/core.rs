//! Driver facade and poll loop.
//!
//! [`Driver`] owns the fixed slot pool and the listener table behind an
//! `Rc<RefCell<..>>` core, so the facade, the poll loop task, and accept
//! callbacks can all hold cheap clones. The core borrow is never held
//! across an await: every async path snapshots what it needs, runs the
//! bounded send loop without the borrow, and re-borrows to apply the
//! outcome.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::DriverConfig;
use crate::error::SocketError;
use crate::ring::ReadSink;
use crate::stack::{MemoryKind, NetworkStack, RawHandle};
use crate::time::TimeProvider;

use super::pool::SlotPool;
use super::queue::AcceptQueue;
use super::slot::send_bounded;
use super::{SlotId, LOCALHOST_SLOT};

type AcceptCallback = Rc<RefCell<dyn FnMut(SlotId)>>;

struct Listener {
    port: u16,
    queue: Rc<AcceptQueue>,
    on_accept: AcceptCallback,
}

/// Counters describing driver activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Connections adopted into slots.
    pub connections_adopted: u64,
    /// Ticks on which an accepted connection waited because every slot
    /// was taken.
    pub pool_exhausted_waits: u64,
    /// Writes and flushes that hit their deadline.
    pub write_timeouts: u64,
    /// Countdown flushes that failed and closed their slot.
    pub flush_failures: u64,
    /// Slots reclaimed after the stack reported a connection failure.
    pub connections_reaped: u64,
    /// Connections that entered an accept queue, across all listeners.
    pub accepts_queued: u64,
    /// Connections dropped at a full accept queue, across all listeners.
    pub accepts_dropped: u64,
    /// Inbound bytes discarded by full read rings, across all slots.
    pub read_bytes_dropped: u64,
}

struct CoreState {
    pool: SlotPool,
    listeners: Vec<Listener>,
    stats: DriverStats,
}

/// Non-blocking TCP transport driver.
///
/// A fixed pool of client slots fronts whichever [`NetworkStack`] the
/// driver was built over. Accepted connections queue in a bounded
/// [`AcceptQueue`] per listener until the poll loop binds them to a free
/// slot and runs the registered accept callback. Writes coalesce into a
/// small per-slot buffer that a countdown flushes a few ticks after the
/// last write; payloads past the large-write threshold bypass the buffer
/// entirely. Every transmission goes through one bounded send loop that
/// chunks, paces, and deadlines it.
///
/// Clones share all state. Spawn [`run`](Driver::run) once on a local
/// task set and call the facade from anywhere on the same thread.
pub struct Driver<S, T>
where
    S: NetworkStack,
    T: TimeProvider,
{
    stack: S,
    time: T,
    config: Rc<DriverConfig>,
    notify: Rc<Notify>,
    core: Rc<RefCell<CoreState>>,
}

impl<S, T> Clone for Driver<S, T>
where
    S: NetworkStack,
    T: TimeProvider,
{
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            time: self.time.clone(),
            config: self.config.clone(),
            notify: self.notify.clone(),
            core: self.core.clone(),
        }
    }
}

impl<S, T> Driver<S, T>
where
    S: NetworkStack,
    T: TimeProvider,
{
    /// Build a driver over `stack` with explicitly injected providers.
    pub fn new(stack: S, time: T, config: DriverConfig) -> Self {
        let core = CoreState {
            pool: SlotPool::new(&config),
            listeners: Vec::new(),
            stats: DriverStats::default(),
        };
        Self {
            stack,
            time,
            config: Rc::new(config),
            notify: Rc::new(Notify::new()),
            core: Rc::new(RefCell::new(core)),
        }
    }

    /// Register a listener on `port` and start accepting.
    ///
    /// `on_accept` runs inside the poll tick once a connection lands in a
    /// slot; keep it short and use it to record the slot for later work.
    /// Listeners are permanent: there is no way to stop one, and at most
    /// `max_listeners` may be registered.
    pub fn initialise_accept<F>(&self, port: u16, on_accept: F) -> Result<(), SocketError>
    where
        F: FnMut(SlotId) + 'static,
    {
        {
            let core = self.core.borrow();
            if core.listeners.len() >= self.config.max_listeners {
                tracing::warn!(
                    port,
                    max = self.config.max_listeners,
                    "listener limit reached"
                );
                return Err(SocketError::Failed);
            }
        }
        let queue = Rc::new(AcceptQueue::new(
            self.config.accept_queue_capacity,
            self.notify.clone(),
        ));
        self.stack
            .begin_listen(port, queue.clone())
            .map_err(|err| {
                tracing::warn!(port, error = %err, "listener registration failed");
                SocketError::Failed
            })?;
        self.core.borrow_mut().listeners.push(Listener {
            port,
            queue,
            on_accept: Rc::new(RefCell::new(on_accept)),
        });
        tracing::info!(port, "listener registered");
        Ok(())
    }

    /// Move buffered inbound bytes for `slot` into `out`, oldest first.
    /// Returns the count copied; 0 means nothing buffered right now.
    pub fn raw_read_data(&self, slot: SlotId, out: &mut [u8]) -> Result<usize, SocketError> {
        let core = self.core.borrow();
        match core.pool.in_use(slot) {
            Some(slot_ref) => Ok(slot_ref.read_into(out)),
            None => Err(SocketError::BadSlot),
        }
    }

    /// Write `data` on `slot`, observing `timeout` for any transmission
    /// the call triggers.
    ///
    /// Small payloads coalesce into the slot's write buffer and only hit
    /// the stack when the buffer fills or a flush runs. Payloads past the
    /// large-write threshold flush whatever is pending and then stream
    /// directly through the bounded send loop, so `kind` can reference
    /// constant data without a copy.
    pub async fn raw_write_data(
        &self,
        slot: SlotId,
        data: &[u8],
        kind: MemoryKind,
        timeout: Duration,
    ) -> Result<(), SocketError> {
        {
            let mut core = self.core.borrow_mut();
            let Some(slot_ref) = core.pool.in_use_mut(slot) else {
                return Err(SocketError::BadSlot);
            };
            if !self.stack.supports(kind) {
                return Err(SocketError::Unsupported);
            }
            slot_ref.set_write_timeout(timeout);
        }

        if data.len() > self.config.large_write_threshold {
            self.flush_slot(slot).await?;
            let handle = {
                let core = self.core.borrow();
                match core.pool.in_use(slot).and_then(|slot_ref| slot_ref.handle()) {
                    Some(handle) => handle,
                    None => return Err(SocketError::Failed),
                }
            };
            let result = send_bounded(
                &self.stack,
                &self.time,
                &self.config,
                handle,
                data,
                kind,
                timeout,
            )
            .await;
            if let Err(SocketError::Timeout) = result {
                self.core.borrow_mut().stats.write_timeouts += 1;
            }
            return result;
        }

        let mut offset = 0;
        while offset < data.len() {
            let flush_job = {
                let mut core = self.core.borrow_mut();
                let Some(slot_ref) = core.pool.in_use_mut(slot) else {
                    // the slot went away during a flush await
                    return Err(SocketError::Failed);
                };
                offset += slot_ref.coalesce(&data[offset..]);
                if offset < data.len() {
                    let Some(handle) = slot_ref.handle() else {
                        return Err(SocketError::Failed);
                    };
                    Some((handle, slot_ref.take_unflushed(), slot_ref.write_timeout()))
                } else {
                    None
                }
            };
            if let Some((handle, bytes, deadline)) = flush_job {
                if let Err(err) = send_bounded(
                    &self.stack,
                    &self.time,
                    &self.config,
                    handle,
                    &bytes,
                    MemoryKind::Ram,
                    deadline,
                )
                .await
                {
                    tracing::warn!(slot = %slot, error = %err, "mid-write flush failed, closing slot");
                    let mut core = self.core.borrow_mut();
                    let core = &mut *core;
                    core.pool.release(slot, &self.stack);
                    if let SocketError::Timeout = err {
                        core.stats.write_timeouts += 1;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Push the slot's buffered bytes to the stack now.
    ///
    /// The buffer is left empty whether or not transmission succeeded; a
    /// failed flush is the caller's cue to close the slot.
    pub async fn raw_flush_all(&self, slot: SlotId) -> Result<(), SocketError> {
        if self.core.borrow().pool.in_use(slot).is_none() {
            return Err(SocketError::BadSlot);
        }
        self.flush_slot(slot).await
    }

    /// Whether `slot` has buffered inbound bytes ready to read.
    pub fn raw_read_available(&self, slot: SlotId) -> bool {
        self.core
            .borrow()
            .pool
            .in_use(slot)
            .map_or(false, |slot_ref| slot_ref.read_available())
    }

    /// Whether `slot` can take a write: true for every valid connected
    /// slot, since the coalescing buffer flushes itself to make room.
    pub fn raw_write_available(&self, slot: SlotId) -> bool {
        self.core.borrow().pool.in_use(slot).is_some()
    }

    /// Release `slot`, closing its connection. A no-op for invalid or
    /// already-free slots, so stale ids are harmless.
    pub fn close_socket(&self, slot: SlotId) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        if core.pool.in_use(slot).is_some() {
            tracing::debug!(slot = %slot, "closing socket");
            core.pool.release(slot, &self.stack);
        }
    }

    /// Whether the underlying link is usable.
    pub fn is_network_up(&self) -> bool {
        self.stack.link_up()
    }

    /// Write a dotted-quad address into `out`.
    ///
    /// Only [`LOCALHOST_SLOT`] resolves, to the device's own address;
    /// every other slot, and a device without one, leaves `out` empty.
    pub fn copy_ip_address(&self, slot: SlotId, out: &mut String) {
        out.clear();
        if slot == LOCALHOST_SLOT {
            if let Some(ip) = self.stack.local_ip() {
                let _ = write!(out, "{ip}");
            }
        }
    }

    /// Snapshot of the driver's counters, folding in the per-queue and
    /// per-ring tallies.
    pub fn stats(&self) -> DriverStats {
        let core = self.core.borrow();
        let mut stats = core.stats;
        for listener in &core.listeners {
            stats.accepts_queued += listener.queue.accepted();
            stats.accepts_dropped += listener.queue.dropped();
        }
        stats.read_bytes_dropped = core.pool.dropped_read_bytes();
        stats
    }

    /// Slots currently holding a connection.
    pub fn connection_count(&self) -> usize {
        self.core.borrow().pool.in_use_count()
    }

    /// Accepted connections still waiting in the queue for `port`.
    pub fn accept_backlog(&self, port: u16) -> usize {
        self.core
            .borrow()
            .listeners
            .iter()
            .find(|listener| listener.port == port)
            .map_or(0, |listener| listener.queue.available())
    }

    /// Run one poll tick: reap failed connections, adopt queued accepts,
    /// and advance flush countdowns.
    pub async fn tick(&self) {
        self.reap_failed_connections();
        let adopted = self.service_accept_queues();
        for (callback, slot) in adopted {
            let mut callback = callback.borrow_mut();
            (&mut *callback)(slot);
        }
        self.run_flush_countdowns().await;
    }

    /// Drive ticks forever: wake early when a queue reports activity,
    /// otherwise on every poll interval. Never returns; spawn it once on
    /// the local task set.
    pub async fn run(&self) {
        tracing::info!(
            slots = self.config.max_concurrent_clients,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "driver poll loop running"
        );
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.time.sleep(self.config.poll_interval) => {}
            }
            self.tick().await;
        }
    }

    /// Release every slot whose connection the stack now reports failed.
    fn reap_failed_connections(&self) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for index in 0..core.pool.len() {
            let id = SlotId(index);
            let handle = core.pool.in_use(id).and_then(|slot_ref| slot_ref.handle());
            if let Some(handle) = handle {
                if !self.stack.is_open(handle) {
                    tracing::warn!(%handle, slot = %id, "stack reported failure, reclaiming slot");
                    core.pool.release(id, &self.stack);
                    core.stats.connections_reaped += 1;
                }
            }
        }
    }

    /// Bind queued handles to free slots, listener by listener. Stops a
    /// listener's drain when the pool runs out; the remaining handles
    /// stay queued for a later tick.
    fn service_accept_queues(&self) -> Vec<(AcceptCallback, SlotId)> {
        let mut adopted = Vec::new();
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for listener in &core.listeners {
            while listener.queue.available() > 0 {
                let Some(id) = core.pool.first_free() else {
                    core.stats.pool_exhausted_waits += 1;
                    tracing::debug!(
                        port = listener.port,
                        waiting = listener.queue.available(),
                        "no free slot, accepted connections stay queued"
                    );
                    break;
                };
                let Some(handle) = listener.queue.get() else {
                    break;
                };
                let Some(slot_ref) = core.pool.slot_mut(id) else {
                    break;
                };
                slot_ref.connect(handle);
                let sink = ReadSink::new(slot_ref.ring(), self.config.read_overflow);
                if let Err(err) = self.stack.attach(handle, sink) {
                    tracing::warn!(%handle, error = %err, "inbound attach failed, dropping connection");
                    core.pool.release(id, &self.stack);
                    continue;
                }
                core.stats.connections_adopted += 1;
                tracing::info!(%handle, slot = %id, port = listener.port, "connection adopted");
                adopted.push((listener.on_accept.clone(), id));
            }
        }
        adopted
    }

    /// Advance every slot's flush countdown; transmit where one expired
    /// with bytes still buffered. A failed countdown flush closes its
    /// slot: nothing is waiting on the result, so the error has nowhere
    /// else to go.
    async fn run_flush_countdowns(&self) {
        let due: Vec<(SlotId, RawHandle, Vec<u8>, Duration)> = {
            let mut core = self.core.borrow_mut();
            let mut due = Vec::new();
            for index in 0..core.pool.len() {
                let id = SlotId(index);
                if let Some(slot_ref) = core.pool.slot_mut(id) {
                    if slot_ref.tick_countdown() {
                        if let Some(handle) = slot_ref.handle() {
                            due.push((
                                id,
                                handle,
                                slot_ref.take_unflushed(),
                                slot_ref.write_timeout(),
                            ));
                        }
                    }
                }
            }
            due
        };
        for (id, handle, bytes, deadline) in due {
            tracing::debug!(slot = %id, bytes = bytes.len(), "flush countdown expired");
            if let Err(err) = send_bounded(
                &self.stack,
                &self.time,
                &self.config,
                handle,
                &bytes,
                MemoryKind::Ram,
                deadline,
            )
            .await
            {
                tracing::warn!(slot = %id, error = %err, "countdown flush failed, closing slot");
                let mut core = self.core.borrow_mut();
                let core = &mut *core;
                core.pool.release(id, &self.stack);
                core.stats.flush_failures += 1;
                if let SocketError::Timeout = err {
                    core.stats.write_timeouts += 1;
                }
            }
        }
    }

    /// Transmit the slot's buffered bytes. The take empties the buffer up
    /// front, so it is clear even when transmission fails.
    async fn flush_slot(&self, slot: SlotId) -> Result<(), SocketError> {
        let (handle, bytes, deadline) = {
            let mut core = self.core.borrow_mut();
            let Some(slot_ref) = core.pool.in_use_mut(slot) else {
                return Err(SocketError::Failed);
            };
            if slot_ref.unflushed_len() == 0 {
                return Ok(());
            }
            let Some(handle) = slot_ref.handle() else {
                return Err(SocketError::Failed);
            };
            (handle, slot_ref.take_unflushed(), slot_ref.write_timeout())
        };
        let result = send_bounded(
            &self.stack,
            &self.time,
            &self.config,
            handle,
            &bytes,
            MemoryKind::Ram,
            deadline,
        )
        .await;
        if let Err(SocketError::Timeout) = result {
            self.core.borrow_mut().stats.write_timeouts += 1;
        }
        result
    }
}
