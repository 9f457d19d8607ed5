//! Network stack abstraction.
//!
//! [`NetworkStack`] is the capability set the driver needs from a
//! platform's TCP machinery: begin listening, deliver inbound bytes,
//! report the send window, send, close, and report link status. Exactly
//! one concrete implementation is chosen when the driver is constructed;
//! the driver is generic over it and never dispatches dynamically.
//!
//! [`TokioStack`] is the hosted implementation over tokio TCP. The
//! scripted [`SimStack`](sim::SimStack) lives in [`sim`].

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::config::{DriverConfig, ReadOverflowPolicy};
use crate::driver::AcceptQueue;
use crate::error::StackError;
use crate::ring::ReadSink;
use crate::task::TaskProvider;

pub mod sim;

pub use sim::{SendRecord, SimStack};

/// Opaque identifier for one stack-level connection.
///
/// Values are assigned by the stack and never reused within a session, so
/// a stale handle held across a slot release can never alias a newer
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of a write live, from the stack's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Ordinary RAM; the stack must copy before the call returns.
    Ram,
    /// Constant data that outlives the write; the stack may reference it
    /// in place instead of copying.
    ConstantNoCopy,
    /// Harvard-architecture program memory; only stacks with a
    /// program-space copy path can source it.
    ProgramMemory,
}

/// Health of one listener, keyed by the port it was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Not yet listening; the first bind attempt is still pending.
    Waiting,
    /// Bound and accepting connections.
    Accepting {
        /// The actual bound port. Differs from the requested port when
        /// port 0 asked for an ephemeral assignment.
        bound_port: u16,
    },
    /// The last bind attempt failed; the listener retries on its fixed
    /// interval.
    Failed,
}

/// The capability set a platform TCP stack exposes to the driver.
///
/// Implementations are cheaply cloneable handles over shared state, so the
/// driver, its background tasks, and tests can all hold one.
#[async_trait(?Send)]
pub trait NetworkStack: Clone {
    /// Begin accepting on `port`, delivering raw handles into `accepts`.
    ///
    /// Structural failures (socket creation, bind, listen) are the
    /// stack's to retry on a fixed interval; they are logged, never
    /// surfaced here. An error means registration itself was refused,
    /// e.g. a second listener on the same port.
    fn begin_listen(&self, port: u16, accepts: Rc<AcceptQueue>) -> Result<(), StackError>;

    /// Health of the listener registered on `port`, if any.
    fn listener_status(&self, port: u16) -> Option<ListenerStatus>;

    /// Start delivering inbound bytes for `handle` into `sink`.
    fn attach(&self, handle: RawHandle, sink: ReadSink) -> Result<(), StackError>;

    /// Bytes the stack can currently take for `handle` in one send call.
    /// Unknown or failed handles report 0.
    fn send_window(&self, handle: RawHandle) -> usize;

    /// Hand `data` to the stack for transmission on `handle`.
    async fn send(&self, handle: RawHandle, data: &[u8], kind: MemoryKind)
        -> Result<(), StackError>;

    /// Whether this stack can source writes from `kind`.
    fn supports(&self, kind: MemoryKind) -> bool;

    /// True while `handle` names a live, non-failed connection.
    fn is_open(&self, handle: RawHandle) -> bool;

    /// Tear down `handle`. Idempotent; unknown handles are ignored.
    fn close(&self, handle: RawHandle);

    /// Whether the link is usable (interface initialised and carrier up).
    fn link_up(&self) -> bool;

    /// The device's own address, when the link has one.
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Send window reported for live hosted connections.
///
/// Hosted stacks do not expose their send-buffer occupancy; a fixed hint
/// keeps the bounded send loop pacing writes while `write_all` provides
/// the real backpressure.
pub const DEFAULT_SEND_WINDOW_HINT: usize = 64 * 1024;

/// Hosted TCP stack over tokio.
///
/// Each listener runs a self-healing acceptor task; each attached
/// connection runs a reader task feeding its slot's ring. All tasks stay
/// on the current thread through the injected [`TaskProvider`].
pub struct TokioStack<TP: TaskProvider + 'static> {
    state: Rc<RefCell<TokioState>>,
    tasks: TP,
    retry_delay: Duration,
    stall_retry: Duration,
    send_window_hint: usize,
}

impl<TP: TaskProvider + 'static> Clone for TokioStack<TP> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            tasks: self.tasks.clone(),
            retry_delay: self.retry_delay,
            stall_retry: self.stall_retry,
            send_window_hint: self.send_window_hint,
        }
    }
}

struct TokioState {
    next_handle: u64,
    conns: HashMap<RawHandle, TokioConn>,
    listeners: HashMap<u16, ListenerStatus>,
    local_ip: Option<Ipv4Addr>,
}

struct TokioConn {
    write: Rc<RefCell<OwnedWriteHalf>>,
    pending_read: Option<OwnedReadHalf>,
    failed: bool,
}

impl<TP: TaskProvider + 'static> TokioStack<TP> {
    /// Create a hosted stack. Listener retry and reader stall pacing come
    /// from `config`.
    pub fn new(tasks: TP, config: &DriverConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(TokioState {
                next_handle: 1,
                conns: HashMap::new(),
                listeners: HashMap::new(),
                local_ip: None,
            })),
            tasks,
            retry_delay: config.listener_retry_delay,
            stall_retry: config.window_full_backoff,
            send_window_hint: DEFAULT_SEND_WINDOW_HINT,
        }
    }

    /// Declare the device's own address for facade reporting.
    pub fn with_local_ip(self, ip: Ipv4Addr) -> Self {
        self.state.borrow_mut().local_ip = Some(ip);
        self
    }
}

#[async_trait(?Send)]
impl<TP: TaskProvider + 'static> NetworkStack for TokioStack<TP> {
    fn begin_listen(&self, port: u16, accepts: Rc<AcceptQueue>) -> Result<(), StackError> {
        {
            let mut state = self.state.borrow_mut();
            if state.listeners.contains_key(&port) {
                return Err(StackError::PortInUse { port });
            }
            state.listeners.insert(port, ListenerStatus::Waiting);
        }
        self.tasks.spawn_task(
            &format!("listener_{port}"),
            accept_task(self.state.clone(), port, accepts, self.retry_delay),
        );
        Ok(())
    }

    fn listener_status(&self, port: u16) -> Option<ListenerStatus> {
        self.state.borrow().listeners.get(&port).copied()
    }

    fn attach(&self, handle: RawHandle, sink: ReadSink) -> Result<(), StackError> {
        let read_half = {
            let mut state = self.state.borrow_mut();
            let conn = state
                .conns
                .get_mut(&handle)
                .ok_or(StackError::UnknownHandle { handle })?;
            match conn.pending_read.take() {
                Some(read_half) => read_half,
                None => {
                    tracing::warn!(%handle, "reader already attached");
                    return Ok(());
                }
            }
        };
        self.tasks.spawn_task(
            &format!("reader_{handle}"),
            reader_task(self.state.clone(), handle, read_half, sink, self.stall_retry),
        );
        Ok(())
    }

    fn send_window(&self, handle: RawHandle) -> usize {
        let state = self.state.borrow();
        match state.conns.get(&handle) {
            Some(conn) if !conn.failed => self.send_window_hint,
            _ => 0,
        }
    }

    async fn send(
        &self,
        handle: RawHandle,
        data: &[u8],
        _kind: MemoryKind,
    ) -> Result<(), StackError> {
        let write = {
            let state = self.state.borrow();
            let conn = state
                .conns
                .get(&handle)
                .ok_or(StackError::UnknownHandle { handle })?;
            if conn.failed {
                return Err(StackError::SendFailed {
                    reason: "connection failed".to_string(),
                });
            }
            conn.write.clone()
        };
        let mut half = write.try_borrow_mut().map_err(|_| StackError::SendFailed {
            reason: "write already in progress".to_string(),
        })?;
        match half.write_all(data).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(conn) = self.state.borrow_mut().conns.get_mut(&handle) {
                    conn.failed = true;
                }
                Err(err.into())
            }
        }
    }

    fn supports(&self, kind: MemoryKind) -> bool {
        // hosted targets have a flat address space but no program-space
        // copy path
        matches!(kind, MemoryKind::Ram | MemoryKind::ConstantNoCopy)
    }

    fn is_open(&self, handle: RawHandle) -> bool {
        let state = self.state.borrow();
        state.conns.get(&handle).map_or(false, |conn| !conn.failed)
    }

    fn close(&self, handle: RawHandle) {
        // dropping the write half sends FIN; the reader task notices the
        // missing entry and exits
        if self.state.borrow_mut().conns.remove(&handle).is_some() {
            tracing::trace!(%handle, "connection closed");
        }
    }

    fn link_up(&self) -> bool {
        // carrier state belongs to the host OS on hosted targets
        true
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.state.borrow().local_ip
    }
}

/// Acceptor task for one listener: bind, accept forever, and on a
/// structural failure retry the bind on a fixed interval.
async fn accept_task(
    state: Rc<RefCell<TokioState>>,
    port: u16,
    accepts: Rc<AcceptQueue>,
    retry_delay: Duration,
) {
    loop {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                state
                    .borrow_mut()
                    .listeners
                    .insert(port, ListenerStatus::Failed);
                tracing::warn!(
                    port,
                    error = %err,
                    retry_ms = retry_delay.as_millis() as u64,
                    "bind failed, listener will retry"
                );
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };
        let bound_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);
        state
            .borrow_mut()
            .listeners
            .insert(port, ListenerStatus::Accepting { bound_port });
        tracing::info!(port, bound_port, "listener accepting connections");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handle = register_connection(&state, stream);
                    tracing::debug!(%handle, %peer, "accepted connection");
                    if !accepts.put(handle) {
                        // full handoff queue: drop the connection, the
                        // peer times out on its side
                        state.borrow_mut().conns.remove(&handle);
                    }
                }
                Err(err) => {
                    // fd exhaustion fails accept back-to-back; retry on
                    // the listener interval rather than spinning
                    tracing::warn!(port, error = %err, "accept error, backing off");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

fn register_connection(
    state: &Rc<RefCell<TokioState>>,
    stream: tokio::net::TcpStream,
) -> RawHandle {
    let (read_half, write_half) = stream.into_split();
    let mut state = state.borrow_mut();
    let handle = RawHandle(state.next_handle);
    state.next_handle += 1;
    state.conns.insert(
        handle,
        TokioConn {
            write: Rc::new(RefCell::new(write_half)),
            pending_read: Some(read_half),
            failed: false,
        },
    );
    handle
}

/// Reader task for one attached connection: pull from the socket, feed
/// the slot's ring, honor the ring's overflow policy.
async fn reader_task(
    state: Rc<RefCell<TokioState>>,
    handle: RawHandle,
    mut read_half: OwnedReadHalf,
    sink: ReadSink,
    stall_retry: Duration,
) {
    let mut buf = [0u8; 1024];
    loop {
        if !state.borrow().conns.contains_key(&handle) {
            break;
        }
        let want = match sink.policy() {
            ReadOverflowPolicy::Stall => {
                let free = sink.free_space();
                if free == 0 {
                    // ring full: stop pulling until the application drains
                    tokio::time::sleep(stall_retry).await;
                    continue;
                }
                free.min(buf.len())
            }
            ReadOverflowPolicy::DropNewest => buf.len(),
        };
        match read_half.read(&mut buf[..want]).await {
            Ok(0) => {
                // peer closed its write side; the slot stays up and the
                // layer above decides when to give up
                tracing::trace!(%handle, "peer closed read side");
                break;
            }
            Ok(count) => {
                // the conn entry can be removed while this read was
                // parked; late bytes must not reach the sink
                if !state.borrow().conns.contains_key(&handle) {
                    tracing::trace!(%handle, count, "read for closed connection discarded");
                    break;
                }
                sink.deliver(&buf[..count]);
            }
            Err(err) => {
                tracing::debug!(%handle, error = %err, "connection read failed");
                if let Some(conn) = state.borrow_mut().conns.get_mut(&handle) {
                    conn.failed = true;
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TokioTaskProvider;

    fn create_test_stack() -> TokioStack<TokioTaskProvider> {
        TokioStack::new(TokioTaskProvider, &DriverConfig::default())
    }

    #[test]
    fn test_supports_ram_and_constant_only() {
        let stack = create_test_stack();
        assert!(stack.supports(MemoryKind::Ram));
        assert!(stack.supports(MemoryKind::ConstantNoCopy));
        assert!(!stack.supports(MemoryKind::ProgramMemory));
    }

    #[test]
    fn test_unknown_handle_is_closed_with_zero_window() {
        let stack = create_test_stack();
        assert!(!stack.is_open(RawHandle(42)));
        assert_eq!(stack.send_window(RawHandle(42)), 0);
        // closing an unknown handle is a no-op
        stack.close(RawHandle(42));
    }

    #[test]
    fn test_local_ip_reported_after_configuration() {
        let stack = create_test_stack();
        assert_eq!(stack.local_ip(), None);
        let stack = stack.with_local_ip(Ipv4Addr::new(192, 168, 4, 20));
        assert_eq!(stack.local_ip(), Some(Ipv4Addr::new(192, 168, 4, 20)));
    }

    #[test]
    fn test_listener_status_unknown_port() {
        let stack = create_test_stack();
        assert_eq!(stack.listener_status(9999), None);
    }
}
