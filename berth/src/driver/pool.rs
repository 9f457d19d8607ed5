//! Fixed pool of client slots.
//!
//! Sized once at driver construction and never grown: the slot count is
//! the hard ceiling on concurrent clients. Claiming scans for the first
//! free slot; releasing resets the slot in place so no allocation happens
//! at steady state.

use crate::config::DriverConfig;
use crate::stack::NetworkStack;

use super::slot::Slot;
use super::SlotId;

#[derive(Debug)]
pub(crate) struct SlotPool {
    slots: Vec<Slot>,
}

impl SlotPool {
    pub(crate) fn new(config: &DriverConfig) -> Self {
        Self {
            slots: (0..config.max_concurrent_clients)
                .map(|_| Slot::new(config))
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Lowest-indexed free slot, if any.
    pub(crate) fn first_free(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|slot| !slot.is_in_use())
            .map(SlotId)
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id.0)
    }

    /// The slot at `id` only when it currently holds a connection. Backs
    /// every facade bounds-and-liveness check.
    pub(crate) fn in_use(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.0).filter(|slot| slot.is_in_use())
    }

    pub(crate) fn in_use_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id.0).filter(|slot| slot.is_in_use())
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_in_use()).count()
    }

    /// Inbound bytes discarded across every slot's ring.
    pub(crate) fn dropped_read_bytes(&self) -> u64 {
        self.slots.iter().map(Slot::dropped_read_bytes).sum()
    }

    /// Release `id` back to the pool, closing its connection.
    pub(crate) fn release<S: NetworkStack>(&mut self, id: SlotId, stack: &S) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.release(stack);
        }
    }
}
