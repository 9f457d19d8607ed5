//! Scripted network stack for deterministic tests.
//!
//! [`SimStack`] implements [`NetworkStack`] entirely in memory:
//! connections are injected by the test, sends are recorded instead of
//! transmitted, and the send window, link state, and failure modes are
//! all scriptable. Paired with the simulated time provider it makes
//! timeout and pacing behavior exactly assertable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use async_trait::async_trait;

use super::{ListenerStatus, MemoryKind, NetworkStack, RawHandle};
use crate::driver::AcceptQueue;
use crate::error::StackError;
use crate::ring::ReadSink;

/// One send call as the stack observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    /// Connection the bytes were sent on.
    pub handle: RawHandle,
    /// Exactly the bytes handed over.
    pub bytes: Vec<u8>,
    /// Declared memory kind.
    pub kind: MemoryKind,
}

/// Scripted in-memory stack.
///
/// Clones share state, so a test keeps one clone for scripting while the
/// driver under test holds the other.
#[derive(Clone, Default)]
pub struct SimStack {
    state: Rc<RefCell<SimState>>,
}

struct SimState {
    listeners: HashMap<u16, SimListener>,
    conns: HashMap<RawHandle, SimConn>,
    sent: Vec<SendRecord>,
    closed: Vec<RawHandle>,
    send_window: usize,
    link_up: bool,
    local_ip: Option<Ipv4Addr>,
    progmem_supported: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
            conns: HashMap::new(),
            sent: Vec::new(),
            closed: Vec::new(),
            send_window: usize::MAX,
            link_up: true,
            local_ip: None,
            progmem_supported: false,
        }
    }
}

struct SimListener {
    queue: Rc<AcceptQueue>,
    status: ListenerStatus,
}

struct SimConn {
    sink: Option<ReadSink>,
    open: bool,
    fail_sends: bool,
}

impl SimStack {
    /// Fresh stack: link up, unbounded send window, no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Present a new connection to the listener on `port`. Returns false
    /// when no listener exists or its accept queue is full; in either
    /// case the connection is discarded.
    pub fn inject_connection(&self, port: u16, handle: RawHandle) -> bool {
        let queue = {
            let mut state = self.state.borrow_mut();
            let Some(listener) = state.listeners.get(&port) else {
                tracing::warn!(port, "no listener to inject into");
                return false;
            };
            let queue = listener.queue.clone();
            state.conns.insert(
                handle,
                SimConn {
                    sink: None,
                    open: true,
                    fail_sends: false,
                },
            );
            queue
        };
        if queue.put(handle) {
            true
        } else {
            self.state.borrow_mut().conns.remove(&handle);
            false
        }
    }

    /// Deliver inbound bytes on `handle`. Returns the count actually
    /// taken; 0 when the connection has no attached sink.
    pub fn inject_bytes(&self, handle: RawHandle, data: &[u8]) -> usize {
        let sink = self
            .state
            .borrow()
            .conns
            .get(&handle)
            .and_then(|conn| conn.sink.clone());
        match sink {
            Some(sink) => sink.deliver(data),
            None => 0,
        }
    }

    /// Script the send window reported for every open connection.
    pub fn set_send_window(&self, bytes: usize) {
        self.state.borrow_mut().send_window = bytes;
    }

    /// All successful sends so far, oldest first.
    pub fn sent(&self) -> Vec<SendRecord> {
        self.state.borrow().sent.clone()
    }

    /// Drain and return the recorded sends.
    pub fn take_sent(&self) -> Vec<SendRecord> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Mark `handle` as failed: it stays known but reports closed and
    /// refuses sends.
    pub fn fail_connection(&self, handle: RawHandle) {
        if let Some(conn) = self.state.borrow_mut().conns.get_mut(&handle) {
            conn.open = false;
        }
    }

    /// Script send failures on `handle` while leaving it open.
    pub fn fail_sends(&self, handle: RawHandle, fail: bool) {
        if let Some(conn) = self.state.borrow_mut().conns.get_mut(&handle) {
            conn.fail_sends = fail;
        }
    }

    /// Whether `close` was called for `handle`.
    pub fn was_closed(&self, handle: RawHandle) -> bool {
        self.state.borrow().closed.contains(&handle)
    }

    /// Script the link state.
    pub fn set_link_up(&self, up: bool) {
        self.state.borrow_mut().link_up = up;
    }

    /// Script the device's own address.
    pub fn set_local_ip(&self, ip: Ipv4Addr) {
        self.state.borrow_mut().local_ip = Some(ip);
    }

    /// Let writes sourced from program memory through `supports`.
    pub fn allow_program_memory(&self) {
        self.state.borrow_mut().progmem_supported = true;
    }

    /// Handles still waiting in the accept queue for `port`.
    pub fn queue_depth(&self, port: u16) -> usize {
        self.state
            .borrow()
            .listeners
            .get(&port)
            .map_or(0, |listener| listener.queue.available())
    }
}

#[async_trait(?Send)]
impl NetworkStack for SimStack {
    fn begin_listen(&self, port: u16, accepts: Rc<AcceptQueue>) -> Result<(), StackError> {
        let mut state = self.state.borrow_mut();
        if state.listeners.contains_key(&port) {
            return Err(StackError::PortInUse { port });
        }
        // binds instantly; port 0 gets a deterministic ephemeral port
        let bound_port = if port == 0 {
            49152 + state.listeners.len() as u16
        } else {
            port
        };
        state.listeners.insert(
            port,
            SimListener {
                queue: accepts,
                status: ListenerStatus::Accepting { bound_port },
            },
        );
        Ok(())
    }

    fn listener_status(&self, port: u16) -> Option<ListenerStatus> {
        self.state
            .borrow()
            .listeners
            .get(&port)
            .map(|listener| listener.status)
    }

    fn attach(&self, handle: RawHandle, sink: ReadSink) -> Result<(), StackError> {
        let mut state = self.state.borrow_mut();
        let conn = state
            .conns
            .get_mut(&handle)
            .ok_or(StackError::UnknownHandle { handle })?;
        conn.sink = Some(sink);
        Ok(())
    }

    fn send_window(&self, handle: RawHandle) -> usize {
        let state = self.state.borrow();
        match state.conns.get(&handle) {
            Some(conn) if conn.open => state.send_window,
            _ => 0,
        }
    }

    async fn send(
        &self,
        handle: RawHandle,
        data: &[u8],
        kind: MemoryKind,
    ) -> Result<(), StackError> {
        let mut state = self.state.borrow_mut();
        let conn = state
            .conns
            .get(&handle)
            .ok_or(StackError::UnknownHandle { handle })?;
        if !conn.open || conn.fail_sends {
            return Err(StackError::SendFailed {
                reason: "scripted send failure".to_string(),
            });
        }
        state.sent.push(SendRecord {
            handle,
            bytes: data.to_vec(),
            kind,
        });
        Ok(())
    }

    fn supports(&self, kind: MemoryKind) -> bool {
        match kind {
            MemoryKind::Ram | MemoryKind::ConstantNoCopy => true,
            MemoryKind::ProgramMemory => self.state.borrow().progmem_supported,
        }
    }

    fn is_open(&self, handle: RawHandle) -> bool {
        self.state
            .borrow()
            .conns
            .get(&handle)
            .map_or(false, |conn| conn.open)
    }

    fn close(&self, handle: RawHandle) {
        let mut state = self.state.borrow_mut();
        if state.conns.remove(&handle).is_some() {
            state.closed.push(handle);
        }
    }

    fn link_up(&self) -> bool {
        self.state.borrow().link_up
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.state.borrow().local_ip
    }
}
