//! Auxiliary buffer table - tracked heap allocations owned by records
//!
//! Every separately-allocated buffer a record reaches through its payload
//! (attribute arrays, element buffers, method tables, digit buffers, ...)
//! lives here as a reference-counted entry. Records store [`BufferId`]s;
//! releasing decrements and frees on zero, so a buffer shared between an
//! owning record and a copy-on-write view is deallocated exactly once, when
//! the last holder releases it.
//!
//! Releasing an entry that is already free is a double free and fatal.

use std::collections::HashMap;

use crate::error;
use crate::object::{ObjRef, SymbolId};
use crate::repr::{CompiledPattern, HashEntry, MatchRegion, NativeBlock};
use crate::runtime::cache::MethodTable;

/// Handle to one tracked auxiliary allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Contents of one auxiliary allocation
pub enum BufferData {
    /// Character buffer (byte strings)
    Bytes(Vec<u8>),
    /// Object reference buffer (array elements, attribute values, struct fields)
    Refs(Vec<ObjRef>),
    /// Hash backing table
    Entries(Vec<HashEntry>),
    /// Class/module method lookup table
    Methods(MethodTable),
    /// Attribute-name-to-index table
    NameIndex(HashMap<SymbolId, u32>),
    /// Big integer digit buffer
    Digits(Vec<u32>),
    /// Compiled pattern engine state
    Pattern(CompiledPattern),
    /// Match-region buffer
    Regions(Vec<MatchRegion>),
    /// Match character-offset table
    CharOffsets(Vec<usize>),
    /// Scope-node local symbol table
    Locals(Vec<SymbolId>),
    /// Opaque native allocation (boxed data, stream descriptors, class ext blocks)
    Native(NativeBlock),
}

impl BufferData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            BufferData::Bytes(_) => "bytes",
            BufferData::Refs(_) => "refs",
            BufferData::Entries(_) => "entries",
            BufferData::Methods(_) => "methods",
            BufferData::NameIndex(_) => "name_index",
            BufferData::Digits(_) => "digits",
            BufferData::Pattern(_) => "pattern",
            BufferData::Regions(_) => "regions",
            BufferData::CharOffsets(_) => "char_offsets",
            BufferData::Locals(_) => "locals",
            BufferData::Native(_) => "native",
        }
    }
}

struct Entry {
    refs: u32,
    data: BufferData,
}

/// Buffer accounting snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub live: usize,
    pub released: usize,
}

/// Table of all live auxiliary allocations
///
/// Plays the generic-allocation half of the host allocator role: `alloc`
/// is the heap allocation a payload constructor performs, `release` is the
/// generic deallocation the force-free dispatcher invokes.
#[derive(Default)]
pub struct BufferTable {
    entries: Vec<Option<Entry>>,
    released: usize,
}

impl BufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a tracked buffer with a single owner
    pub fn alloc(&mut self, data: BufferData) -> BufferId {
        let id = BufferId(self.entries.len() as u32);
        tracing::trace!(buffer = id.0, kind = data.kind_name(), "buffer allocated");
        self.entries.push(Some(Entry { refs: 1, data }));
        id
    }

    /// Add a reference for a shared view of an existing buffer
    pub fn retain(&mut self, id: BufferId) {
        match self.entries.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(entry) => entry.refs += 1,
            None => error::buffer_double_free(id.0),
        }
    }

    /// Drop one reference; the buffer is freed when the count reaches zero.
    ///
    /// Fatal if the buffer was already freed.
    pub fn release(&mut self, id: BufferId) {
        let slot = match self.entries.get_mut(id.0 as usize) {
            Some(slot) => slot,
            None => error::buffer_double_free(id.0),
        };
        match slot {
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                tracing::trace!(buffer = id.0, refs = entry.refs, "shared buffer reference dropped");
            }
            Some(_) => {
                *slot = None;
                self.released += 1;
                tracing::trace!(buffer = id.0, "buffer freed");
            }
            None => error::buffer_double_free(id.0),
        }
    }

    /// Borrow buffer contents (fatal if freed)
    pub fn get(&self, id: BufferId) -> &BufferData {
        match self.entries.get(id.0 as usize).and_then(Option::as_ref) {
            Some(entry) => &entry.data,
            None => error::buffer_double_free(id.0),
        }
    }

    /// Mutably borrow buffer contents (fatal if freed)
    pub fn get_mut(&mut self, id: BufferId) -> &mut BufferData {
        match self.entries.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(entry) => &mut entry.data,
            None => error::buffer_double_free(id.0),
        }
    }

    /// Whether the buffer has not been freed yet
    pub fn is_live(&self, id: BufferId) -> bool {
        self.entries
            .get(id.0 as usize)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    /// Current reference count (0 when freed); for assertions and logging
    pub fn ref_count(&self, id: BufferId) -> u32 {
        self.entries
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            live: self.entries.iter().filter(|e| e.is_some()).count(),
            released: self.released,
        }
    }
}
