//! Heap - slot arena, free list and record lifecycle
//!
//! Design: records live in a slot arena indexed by [`ObjRef`] slot ids,
//! with an intrusive free list threaded through recycled slots. Each slot
//! is an explicit state machine:
//!
//! ```text
//! Free -> Live -> Free                      (normal force-free)
//! Free -> Live -> Deferred -> Free          (unreleasable resource; the
//!                                            deferred-finalization pass is
//!                                            the only actor that performs
//!                                            the final transition)
//! ```
//!
//! The heap owns the [`BufferTable`] holding every auxiliary allocation
//! records point at, and the side table for extended attribute overflow.

mod buffers;


pub use buffers::{BufferData, BufferId, BufferStats, BufferTable};

use std::collections::HashMap;

use crate::error;
use crate::object::ObjRef;
use crate::repr::Repr;

/// Record flag: an external attribute overflow table exists for this object
pub const FL_EXTENDED_ATTRS: u32 = 1 << 0;
/// Record flag: the payload's element buffer is a shared copy-on-write view
pub const FL_SHARED: u32 = 1 << 1;

/// Finalizer callback stashed with a deferred record; invoked exactly once
/// by the deferred-finalization pass, never by the dispatcher itself.
pub type NativeFinalizer = fn(&mut BufferTable, BufferId);

/// One heap object representation record
pub struct Record {
    pub flags: u32,
    /// Class of this object (nil only for bootstrap roots)
    pub class: ObjRef,
    pub repr: Repr,
}

impl Record {
    pub fn new(class: ObjRef, repr: Repr) -> Self {
        Self { flags: 0, class, repr }
    }
}

/// Slot state machine
pub enum Slot {
    /// Recycled; linked into the free list
    Free { next: Option<u32> },
    /// Occupied by a live record
    Live(Record),
    /// Awaiting the runtime's deferred-finalization pass
    Deferred {
        finalizer: NativeFinalizer,
        data: Option<BufferId>,
    },
}

/// Observable slot state (for callers and tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Live,
    Deferred,
}

/// Heap accounting snapshot
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub live: usize,
    pub free: usize,
    pub deferred: usize,
    pub recycled: usize,
    pub buffers: BufferStats,
}

/// Slot arena plus auxiliary allocation table
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    live: usize,
    deferred: usize,
    recycled: usize,
    /// External attribute overflow tables, keyed by slot (records only carry
    /// the FL_EXTENDED_ATTRS flag, mirroring generic attribute storage)
    extended_attrs: HashMap<u32, BufferId>,
    pub buffers: BufferTable,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            deferred: 0,
            recycled: 0,
            extended_attrs: HashMap::new(),
            buffers: BufferTable::new(),
        }
    }

    /// Allocate a record, reusing a recycled slot when one is available
    pub fn alloc(&mut self, record: Record) -> ObjRef {
        self.live += 1;
        match self.free_head {
            Some(slot) => {
                let next = match &self.slots[slot as usize] {
                    Slot::Free { next } => *next,
                    _ => error::broken_object(slot, "on free list but not free"),
                };
                self.free_head = next;
                self.slots[slot as usize] = Slot::Live(record);
                tracing::trace!(slot, "slot reused from free list");
                ObjRef::from_slot(slot)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot::Live(record));
                ObjRef::from_slot(slot)
            }
        }
    }

    /// Observable state of the slot behind a reference
    pub fn state(&self, obj: ObjRef) -> SlotState {
        debug_assert!(obj.is_heap());
        match self.slots.get(obj.as_slot() as usize) {
            Some(Slot::Live(_)) => SlotState::Live,
            Some(Slot::Deferred { .. }) => SlotState::Deferred,
            _ => SlotState::Free,
        }
    }

    /// Borrow the live record behind a reference (fatal otherwise)
    pub fn record(&self, obj: ObjRef) -> &Record {
        let slot = obj.as_slot();
        match self.slots.get(slot as usize) {
            Some(Slot::Live(record)) => record,
            Some(Slot::Deferred { .. }) => error::broken_object(slot, "pending deferred finalization"),
            _ => error::broken_object(slot, "already recycled"),
        }
    }

    /// Mutably borrow the live record behind a reference (fatal otherwise)
    pub fn record_mut(&mut self, obj: ObjRef) -> &mut Record {
        let slot = obj.as_slot();
        match self.slots.get_mut(slot as usize) {
            Some(Slot::Live(record)) => record,
            Some(Slot::Deferred { .. }) => error::broken_object(slot, "pending deferred finalization"),
            _ => error::broken_object(slot, "already recycled"),
        }
    }

    /// Take the record out of its slot for teardown.
    ///
    /// The slot is parked as free-but-unlinked; the dispatcher must follow
    /// up with [`Heap::recycle_taken`] or [`Heap::make_deferred`].
    pub(crate) fn take_record(&mut self, obj: ObjRef) -> Record {
        let slot = obj.as_slot();
        let state = match self.slots.get_mut(slot as usize) {
            Some(state) => state,
            None => error::broken_object(slot, "out of range"),
        };
        match state {
            Slot::Live(_) => {
                let taken = std::mem::replace(state, Slot::Free { next: None });
                match taken {
                    Slot::Live(record) => record,
                    _ => unreachable!(),
                }
            }
            Slot::Deferred { .. } => error::broken_object(slot, "pending deferred finalization"),
            Slot::Free { .. } => error::broken_object(slot, "already recycled"),
        }
    }

    /// Hand a taken slot back to the free list for reuse
    pub(crate) fn recycle_taken(&mut self, obj: ObjRef) {
        let slot = obj.as_slot();
        self.slots[slot as usize] = Slot::Free { next: self.free_head };
        self.free_head = Some(slot);
        self.live -= 1;
        self.recycled += 1;
        crate::logging::log_recycle(slot);
    }

    /// Rewrite a taken slot to the deferred-finalization pseudo-state,
    /// handing ownership of the resource handle to the deferred pass.
    pub(crate) fn make_deferred(
        &mut self,
        obj: ObjRef,
        finalizer: NativeFinalizer,
        data: Option<BufferId>,
    ) {
        let slot = obj.as_slot();
        self.slots[slot as usize] = Slot::Deferred { finalizer, data };
        self.live -= 1;
        self.deferred += 1;
    }

    /// Complete deferred finalization: invoke the stashed callback once and
    /// recycle the slot. Called only from the deferred-finalization pass.
    pub(crate) fn finalize_deferred(&mut self, slot: u32) {
        let state = match self.slots.get_mut(slot as usize) {
            Some(state) => state,
            None => error::broken_object(slot, "out of range"),
        };
        let taken = std::mem::replace(state, Slot::Free { next: self.free_head });
        match taken {
            Slot::Deferred { finalizer, data } => {
                self.free_head = Some(slot);
                self.deferred -= 1;
                self.recycled += 1;
                if let Some(id) = data {
                    finalizer(&mut self.buffers, id);
                }
                crate::logging::log_recycle(slot);
            }
            other => {
                self.slots[slot as usize] = other;
                error::broken_object(slot, "not pending deferred finalization")
            }
        }
    }

    /// Attach an external attribute overflow table and set the flag
    pub fn set_extended_attrs(&mut self, obj: ObjRef, table: BufferId) {
        let slot = obj.as_slot();
        self.record_mut(obj).flags |= FL_EXTENDED_ATTRS;
        self.extended_attrs.insert(slot, table);
    }

    /// Detach the overflow table, if any (the caller releases it)
    pub(crate) fn take_extended_attrs(&mut self, obj: ObjRef) -> Option<BufferId> {
        self.extended_attrs.remove(&obj.as_slot())
    }

    pub fn extended_attrs(&self, obj: ObjRef) -> Option<BufferId> {
        self.extended_attrs.get(&obj.as_slot()).copied()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live: self.live,
            free: self.slots.len() - self.live - self.deferred,
            deferred: self.deferred,
            recycled: self.recycled,
            buffers: self.buffers.stats(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
