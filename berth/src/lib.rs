//! # berth
//!
//! Slot-pooled non-blocking TCP transport driver for small devices.
//!
//! This crate provides:
//! - **Driver facade**: Slot-addressed reads, writes, flushes, and close
//!   over a fixed pool of client connections
//! - **Bounded accepting**: A per-listener accept queue that survives
//!   connection bursts in constant memory
//! - **Write coalescing**: Small writes batch in a per-slot buffer and
//!   flush on a countdown; large writes stream straight to the stack
//! - **Pluggable providers**: A hosted tokio stack and clock for
//!   production, scripted simulation twins for deterministic tests
//!
//! Everything runs cooperatively on one thread: background tasks and the
//! poll loop share state through `Rc`, so the crate expects a
//! current-thread runtime with local task support.
//!
//! ## Quick start
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use berth::{Driver, DriverConfig, MemoryKind, RawHandle, SimStack, SimTimeProvider, SlotId};
//! use std::time::Duration;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_all()
//!     .build()?;
//! runtime.block_on(async {
//!     let stack = SimStack::new();
//!     let driver = Driver::new(stack.clone(), SimTimeProvider::new(), DriverConfig::default());
//!
//!     driver.initialise_accept(3333, |slot| tracing::info!(%slot, "client connected"))?;
//!     stack.inject_connection(3333, RawHandle(7));
//!     driver.tick().await;
//!
//!     driver
//!         .raw_write_data(SlotId(0), b"hi", MemoryKind::Ram, Duration::from_secs(1))
//!         .await?;
//!     driver.raw_flush_all(SlotId(0)).await?;
//!     assert_eq!(stack.sent()[0].bytes, b"hi");
//!     Ok::<(), berth::SocketError>(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Driver tuning knobs.
pub mod config;

/// Driver facade, slot pool, and accept queue.
pub mod driver;

/// Error types for socket and stack operations.
pub mod error;

/// Inbound byte ring and its overflow-policy sink.
pub mod ring;

/// Network stack capability trait and implementations.
pub mod stack;

/// Task spawning abstraction.
pub mod task;

/// Time abstraction with tokio-backed and simulated clocks.
pub mod time;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Config exports
pub use config::{DriverConfig, ReadOverflowPolicy};

// Driver exports
pub use driver::{AcceptQueue, Driver, DriverStats, SlotId, LOCALHOST_SLOT};

// Error exports
pub use error::{SocketError, StackError};

// Ring exports
pub use ring::{ByteRing, ReadSink, SharedRing};

// Stack exports
pub use stack::{
    ListenerStatus, MemoryKind, NetworkStack, RawHandle, SendRecord, SimStack, TokioStack,
    DEFAULT_SEND_WINDOW_HINT,
};

// Provider exports
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{SimTimeProvider, TimeProvider, TokioTimeProvider};
