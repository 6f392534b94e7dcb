//! Deferred finalization - the runtime's asynchronous teardown path
//!
//! Records holding resources that cannot be released synchronously (open
//! streams, boxed native data with a registered finalizer) are converted
//! in place to the deferred pseudo-state and queued here. The pass invokes
//! each stashed callback exactly once and is the only actor allowed to
//! move a deferred slot back to the free list.

use crate::heap::{BufferId, BufferTable, Heap};

/// Queue of slots awaiting deferred finalization
#[derive(Default)]
pub struct DeferredQueue {
    pending: Vec<u32>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, slot: u32) {
        self.pending.push(slot);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every pending finalizer and recycle the slots. Returns the
    /// number of records finalized.
    pub(crate) fn run(&mut self, heap: &mut Heap) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for slot in pending {
            heap.finalize_deferred(slot);
        }
        if count > 0 {
            crate::logging::log_deferred_pass(count);
        }
        count
    }
}

/// Stream teardown: releases the descriptor state block. Streams always go
/// through here so a descriptor the scheduler may still reference is never
/// double-closed by a synchronous free.
pub fn stream_finalize(buffers: &mut BufferTable, fptr: BufferId) {
    tracing::trace!(buffer = fptr.0, "stream descriptor finalized");
    buffers.release(fptr);
}

/// Generic finalizer for boxed native data: hands the contents back to the
/// generic allocator once the deferred pass runs.
pub fn native_finalize(buffers: &mut BufferTable, contents: BufferId) {
    tracing::trace!(buffer = contents.0, "boxed native contents finalized");
    buffers.release(contents);
}
