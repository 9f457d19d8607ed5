//! Driver facade and its internal machinery.
//!
//! [`Driver`] is the application-facing surface: listener registration,
//! slot-addressed reads and writes, flushes, and close. Behind it sit the
//! bounded [`AcceptQueue`], the fixed slot pool, and the per-slot write
//! state machine, all serviced by the cooperative poll loop.

use std::fmt;

mod core;
mod pool;
mod queue;
mod slot;

pub use self::core::{Driver, DriverStats};
pub use queue::AcceptQueue;

/// Index of a slot in the fixed client pool.
///
/// Handed to the accept callback on adoption and passed back into every
/// facade operation. Stale values are tolerated: operations on a slot
/// that has since been released report a bad-slot error or act as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pseudo-slot addressing the device itself.
///
/// Only meaningful to [`Driver::copy_ip_address`], which reports the
/// device's own address for it and an empty string for everything else.
pub const LOCALHOST_SLOT: SlotId = SlotId(usize::MAX);
