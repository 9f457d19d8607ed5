//! Error types for the driver facade and the network stacks beneath it.

use crate::stack::RawHandle;

/// Failure taxonomy for driver facade operations.
///
/// Success is the `Ok` arm of the operation itself; these variants cover
/// every failure a caller can observe through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// Generic failure: listener slots exhausted, stack refused the
    /// operation, or the connection is gone. Not retried automatically.
    #[error("socket operation failed")]
    Failed,

    /// A write reached its deadline with bytes still unsent. The caller
    /// must close the slot; the timeout detector does not close it.
    #[error("write timed out")]
    Timeout,

    /// The memory kind cannot be sourced by this network stack. The caller
    /// must copy the data into plain RAM before writing.
    #[error("memory kind not supported by this stack")]
    Unsupported,

    /// Slot index out of range or not in use. Always a caller bug, never
    /// transient.
    #[error("invalid or unused slot")]
    BadSlot,
}

/// Errors raised inside a network stack implementation.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// The handle does not name a live connection on this stack.
    #[error("unknown connection handle {handle}")]
    UnknownHandle {
        /// The offending handle.
        handle: RawHandle,
    },

    /// The stack refused or aborted a send.
    #[error("send failed: {reason}")]
    SendFailed {
        /// What went wrong.
        reason: String,
    },

    /// A port is already claimed by another listener on this stack.
    #[error("port {port} already has a listener")]
    PortInUse {
        /// The contested port.
        port: u16,
    },
}

impl From<StackError> for SocketError {
    fn from(_: StackError) -> Self {
        SocketError::Failed
    }
}

impl From<std::io::Error> for StackError {
    fn from(err: std::io::Error) -> Self {
        StackError::SendFailed {
            reason: err.to_string(),
        }
    }
}
