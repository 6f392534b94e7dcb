//! Force-free dispatcher - deterministic, synchronous object reclamation
//!
//! The single capability this crate exposes to embedders: given a live
//! object reference, immediately release the auxiliary storage backing it
//! and hand its slot back to the recycler, bypassing the collector. Control
//! flow is straight-line and synchronous:
//!
//! ```text
//! validate -> user destructor hook -> representation-specific release
//!          -> slot recycle -> return hook result
//! ```
//!
//! Resources whose release is not safely synchronous (open streams, boxed
//! native data with a registered finalizer) are not released here: the
//! record is rewritten in place to the deferred-finalization state and the
//! routine returns early without recycling the slot.
//!
//! # Reentrancy
//!
//! The destructor hook runs arbitrary user code and may re-enter the
//! runtime, including allocating or force-freeing other objects. A hook
//! that force-frees its own receiver is detected at the re-entry, before
//! the hook would run a second time, and treated as a broken object
//! (fatal).
//!
//! Callers must treat any reference passed here as invalid for all further
//! use afterward, whatever the result was.

use crate::error::{self, FreeError, FreeResult};
use crate::heap::{BufferData, BufferId, SlotState, FL_EXTENDED_ATTRS};
use crate::object::ObjRef;
use crate::repr::{ClassPayload, NodePayload, ReleaseHook, Repr};
use crate::runtime::{deferred, Runtime};

/// Conventional name of the user-level destructor hook
pub const DESTRUCTOR_HOOK: &str = "__destruct__";

/// Force-free one object.
///
/// Returns the destructor hook's result (nil when no hook is defined).
/// Rejects immediates and the critical singleton set with
/// [`FreeError`]; a reference whose slot is not live is a broken object
/// and fatal. Calling this twice on the same reference is a precondition
/// violation, not a tolerated no-op.
pub fn force_free(rt: &mut Runtime, obj: ObjRef) -> FreeResult<ObjRef> {
    // Immediates have no heap representation to free
    if obj.is_immediate() {
        return Err(FreeError::ImmediateTarget);
    }

    // The bootstrap singletons hold the runtime together
    if rt.core().is_critical(obj) {
        return Err(FreeError::CriticalSingleton);
    }

    let slot = obj.as_slot();
    // A hook re-freeing its own receiver would recurse through the hook
    // forever; catch the re-entry before the hook runs again
    if rt.tearing_down.contains(&slot) {
        error::broken_object(slot, "already being torn down");
    }
    if rt.heap.state(obj) != SlotState::Live {
        error::broken_object(slot, state_name(rt.heap.state(obj)));
    }

    // Run the destructor hook before touching any storage, so it can still
    // inspect the object's externally-visible state.
    let hook = rt.intern(DESTRUCTOR_HOOK);
    rt.tearing_down.insert(slot);
    let destruct_value = if rt.responds_to(obj, hook) {
        rt.invoke(obj, hook).unwrap_or(ObjRef::nil())
    } else {
        ObjRef::nil()
    };
    rt.tearing_down.remove(&slot);

    // The slot must still be live once the hook returns
    if rt.heap.state(obj) != SlotState::Live {
        error::broken_object(slot, state_name(rt.heap.state(obj)));
    }

    // External attribute overflow table
    if rt.heap.record(obj).flags & FL_EXTENDED_ATTRS != 0 {
        if let Some(table) = rt.heap.take_extended_attrs(obj) {
            rt.heap.buffers.release(table);
        }
        rt.heap.record_mut(obj).flags &= !FL_EXTENDED_ATTRS;
    }

    let record = rt.heap.take_record(obj);
    let kind = record.repr.kind_name();
    let flags = record.flags;

    match record.repr {
        Repr::Object(payload) => {
            if let crate::repr::FieldStorage::External(buf) = payload.attrs {
                rt.heap.buffers.release(buf);
            }
        }

        Repr::Class(payload) | Repr::Module(payload) => {
            free_class(rt, obj, payload);
        }

        Repr::ByteString(payload) => {
            payload.release(flags, &mut rt.heap.buffers);
        }

        Repr::Array(payload) => {
            payload.release(flags, &mut rt.heap.buffers);
        }

        Repr::Hash(payload) => {
            if let Some(table) = payload.table {
                rt.heap.buffers.release(table);
            }
        }

        Repr::Pattern(payload) => {
            if let Some(compiled) = payload.compiled {
                rt.heap.buffers.release(compiled);
            }
        }

        Repr::Data(payload) => {
            if let Some(contents) = payload.contents {
                if let Some(result) =
                    free_boxed_contents(rt, obj, kind, contents, payload.release, destruct_value)
                {
                    return result;
                }
            }
        }

        Repr::TypedData(payload) => {
            // The release strategy lives on the static type descriptor
            if let Some(contents) = payload.contents {
                if let Some(result) =
                    free_boxed_contents(rt, obj, kind, contents, payload.ty.release, destruct_value)
                {
                    return result;
                }
            }
        }

        Repr::MatchResult(payload) => {
            if let Some(ext) = payload.ext {
                rt.heap.buffers.release(ext.regions);
                if let Some(offsets) = ext.char_offsets {
                    rt.heap.buffers.release(offsets);
                }
                rt.heap.buffers.release(ext.record);
            }
        }

        Repr::Stream(payload) => {
            // Stream teardown always goes through the runtime's own
            // finalization path; the scheduler may still hold the
            // descriptor, so never release it synchronously.
            if let Some(fptr) = payload.fptr {
                rt.heap
                    .make_deferred(obj, deferred::stream_finalize, Some(fptr));
                rt.deferred.push(slot);
                crate::logging::log_deferred(slot, kind);
                return Ok(destruct_value);
            }
        }

        Repr::BigInt(payload) => {
            if let crate::repr::DigitStorage::External(digits) = payload.digits {
                rt.heap.buffers.release(digits);
            }
        }

        Repr::Node(payload) => match payload {
            NodePayload::Scope { locals: Some(locals) } => {
                rt.heap.buffers.release(locals);
            }
            NodePayload::Alloca { child } => {
                rt.heap.buffers.release(child);
            }
            NodePayload::Scope { locals: None } | NodePayload::Plain => {}
        },

        Repr::Struct(payload) => {
            if let crate::repr::FieldStorage::External(buf) = payload.fields {
                rt.heap.buffers.release(buf);
            }
        }

        // No auxiliary storage
        Repr::Float(_) | Repr::Rational { .. } | Repr::Complex { .. } => {}
    }

    rt.heap.recycle_taken(obj);
    crate::logging::log_force_free(slot, kind);

    Ok(destruct_value)
}

/// Force-free a batch, left to right, ignoring individual results.
///
/// No transactional guarantee: a failure at element *i* aborts the rest of
/// the batch and nothing already freed is rolled back. Elements after the
/// failing one are left untouched.
pub fn force_free_all(rt: &mut Runtime, objs: &[ObjRef]) -> FreeResult<()> {
    for obj in objs {
        force_free(rt, *obj)?;
    }
    Ok(())
}

/// Class/module teardown.
///
/// Ordering matters: the method-resolution cache is invalidated *before*
/// the method table is released, so no still-live subclass can resolve
/// through freed storage afterward.
fn free_class(rt: &mut Runtime, class: ObjRef, payload: ClassPayload) {
    rt.cache.invalidate_class(class);

    // Release every entry in the method table, then the table itself
    let entry_count = match rt.heap.buffers.get_mut(payload.methods) {
        BufferData::Methods(table) => {
            let count = table.len();
            table.clear();
            count
        }
        _ => error::buffer_kind_mismatch(payload.methods.0, "methods"),
    };
    tracing::trace!(
        class = class.as_slot(),
        methods = entry_count,
        "method table released"
    );
    rt.heap.buffers.release(payload.methods);

    if let Some(attrs) = payload.attrs {
        rt.heap.buffers.release(attrs);
    }
    if let Some(index) = payload.attr_index {
        rt.heap.buffers.release(index);
    }
    rt.heap.buffers.release(payload.ext);
}

/// Boxed-native-data release. Returns `Some(result)` when the record was
/// converted to deferred finalization and the dispatcher must return early
/// without recycling the slot.
fn free_boxed_contents(
    rt: &mut Runtime,
    obj: ObjRef,
    kind: &'static str,
    contents: BufferId,
    release: ReleaseHook,
    destruct_value: ObjRef,
) -> Option<FreeResult<ObjRef>> {
    match release {
        // The record does not own the contents
        ReleaseHook::None => None,
        // Plain allocation: hand it straight back to the generic allocator
        ReleaseHook::Allocator => {
            rt.heap.buffers.release(contents);
            None
        }
        // A registered finalizer may require coordination the collector
        // normally guarantees; stash it for the deferred pass instead.
        ReleaseHook::Finalizer(finalizer) => {
            let slot = obj.as_slot();
            rt.heap.make_deferred(obj, finalizer, Some(contents));
            rt.deferred.push(slot);
            crate::logging::log_deferred(slot, kind);
            Some(Ok(destruct_value))
        }
    }
}

fn state_name(state: SlotState) -> &'static str {
    match state {
        SlotState::Free => "already recycled",
        SlotState::Live => "live",
        SlotState::Deferred => "pending deferred finalization",
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::heap::SlotState;
    use crate::repr::{DataType, MatchRegion};
    use crate::runtime::deferred::native_finalize;

    fn runtime() -> Runtime {
        Runtime::new()
    }

    #[test]
    fn frees_plain_object_with_embedded_attrs() {
        let mut rt = runtime();
        let class = rt.new_class(rt.core().object);
        let obj = rt.new_object(class);
        let before = rt.heap.stats().buffers.released;

        rt.force_free(obj).unwrap();

        assert_eq!(rt.heap.state(obj), SlotState::Free);
        // Embedded storage allocates nothing, so nothing is released
        assert_eq!(rt.heap.stats().buffers.released, before);
    }

    #[test]
    fn frees_external_attr_buffer() {
        let mut rt = runtime();
        let class = rt.new_class(rt.core().object);
        let attrs = (0..8).map(ObjRef::from_fixnum).collect();
        let obj = rt.new_object_with_attrs(class, attrs);
        let before = rt.heap.stats().buffers.released;

        rt.force_free(obj).unwrap();

        assert_eq!(rt.heap.stats().buffers.released, before + 1);
    }

    #[test]
    fn frees_extended_attr_table() {
        let mut rt = runtime();
        let class = rt.new_class(rt.core().object);
        let obj = rt.new_object(class);
        let name = rt.intern("overflow");
        rt.set_extended_attr(obj, name, ObjRef::from_fixnum(1));
        let table = rt.heap.extended_attrs(obj).unwrap();

        rt.force_free(obj).unwrap();

        assert!(!rt.heap.buffers.is_live(table));
    }

    #[test]
    fn frees_class_attr_and_index_tables() {
        let mut rt = runtime();
        let class = rt.new_class(rt.core().object);
        let name = rt.intern("size");
        rt.attach_class_attrs(class, vec![(name, ObjRef::from_fixnum(0))]);
        let (attrs, index) = match &rt.heap.record(class).repr {
            Repr::Class(p) => (p.attrs.unwrap(), p.attr_index.unwrap()),
            _ => unreachable!(),
        };

        rt.force_free(class).unwrap();

        assert!(!rt.heap.buffers.is_live(attrs));
        assert!(!rt.heap.buffers.is_live(index));
        assert_eq!(rt.heap.state(class), SlotState::Free);
    }

    #[test]
    fn frees_module_method_table() {
        let mut rt = runtime();
        let module = rt.new_module();
        let name = rt.intern("helper");
        rt.define_method(module, name, Rc::new(|_, _| ObjRef::nil()));
        let methods = match &rt.heap.record(module).repr {
            Repr::Module(p) => p.methods,
            _ => unreachable!(),
        };

        rt.force_free(module).unwrap();

        assert!(!rt.heap.buffers.is_live(methods));
        assert_eq!(rt.heap.state(module), SlotState::Free);
    }

    #[test]
    fn frees_string_buffer() {
        let mut rt = runtime();
        let s = rt.new_string("hello");
        let buf = match &rt.heap.record(s).repr {
            Repr::ByteString(p) => p.buf,
            _ => unreachable!(),
        };

        rt.force_free(s).unwrap();

        assert!(!rt.heap.buffers.is_live(buf));
        assert_eq!(rt.heap.state(s), SlotState::Free);
    }

    #[test]
    fn shared_string_buffer_survives_freeing_the_view() {
        let mut rt = runtime();
        let owner = rt.new_string("shared contents");
        let view = rt.new_shared_string(owner);
        let buf = match &rt.heap.record(owner).repr {
            Repr::ByteString(p) => p.buf,
            _ => unreachable!(),
        };

        rt.force_free(view).unwrap();

        // The owner still reads the buffer
        assert!(rt.heap.buffers.is_live(buf));
        assert_eq!(rt.string_text(owner), "shared contents");

        rt.force_free(owner).unwrap();
        assert!(!rt.heap.buffers.is_live(buf));
    }

    #[test]
    fn shared_array_buffer_released_once_overall() {
        let mut rt = runtime();
        let owner = rt.new_array(vec![ObjRef::from_fixnum(1), ObjRef::from_fixnum(2)]);
        let view = rt.new_shared_array(owner);
        let buf = match &rt.heap.record(owner).repr {
            Repr::Array(p) => p.buf,
            _ => unreachable!(),
        };

        rt.force_free(owner).unwrap();
        assert!(rt.heap.buffers.is_live(buf));
        rt.force_free(view).unwrap();
        assert!(!rt.heap.buffers.is_live(buf));
    }

    #[test]
    fn frees_hash_backing_table() {
        let mut rt = runtime();
        let h = rt.new_hash(vec![(ObjRef::from_fixnum(1), ObjRef::from_fixnum(2))]);
        let table = match &rt.heap.record(h).repr {
            Repr::Hash(p) => p.table.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(h).unwrap();
        assert!(!rt.heap.buffers.is_live(table));
    }

    #[test]
    fn empty_hash_has_nothing_to_release() {
        let mut rt = runtime();
        let h = rt.new_hash(vec![]);
        let before = rt.heap.stats().buffers.released;

        rt.force_free(h).unwrap();
        assert_eq!(rt.heap.stats().buffers.released, before);
    }

    #[test]
    fn frees_compiled_pattern_state() {
        let mut rt = runtime();
        let p = rt.new_pattern("he(l+)o");
        let compiled = match &rt.heap.record(p).repr {
            Repr::Pattern(payload) => payload.compiled.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(p).unwrap();
        assert!(!rt.heap.buffers.is_live(compiled));

        let empty = rt.new_empty_pattern();
        rt.force_free(empty).unwrap();
    }

    #[test]
    fn allocator_release_hook_frees_synchronously() {
        let mut rt = runtime();
        let d = rt.new_data(256, ReleaseHook::Allocator);
        let contents = match &rt.heap.record(d).repr {
            Repr::Data(p) => p.contents.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(d).unwrap();

        assert!(!rt.heap.buffers.is_live(contents));
        assert_eq!(rt.heap.state(d), SlotState::Free);
        assert_eq!(rt.pending_finalizers(), 0);
    }

    #[test]
    fn finalizer_release_hook_defers() {
        let mut rt = runtime();
        let d = rt.new_data(256, ReleaseHook::Finalizer(native_finalize));
        let contents = match &rt.heap.record(d).repr {
            Repr::Data(p) => p.contents.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(d).unwrap();

        // Not recycled, not released; parked for the deferred pass
        assert_eq!(rt.heap.state(d), SlotState::Deferred);
        assert!(rt.heap.buffers.is_live(contents));
        assert_eq!(rt.pending_finalizers(), 1);

        assert_eq!(rt.run_deferred_finalizers(), 1);
        assert!(!rt.heap.buffers.is_live(contents));
        assert_eq!(rt.heap.state(d), SlotState::Free);
    }

    #[test]
    fn empty_data_with_finalizer_recycles_synchronously() {
        let mut rt = runtime();
        let d = rt.new_empty_data(ReleaseHook::Finalizer(native_finalize));

        rt.force_free(d).unwrap();

        // A registered finalizer with nothing to finalize defers nothing
        assert_eq!(rt.heap.state(d), SlotState::Free);
        assert_eq!(rt.pending_finalizers(), 0);
    }

    #[test]
    fn none_release_hook_leaves_contents_alone() {
        let mut rt = runtime();
        let d = rt.new_data(64, ReleaseHook::None);
        let contents = match &rt.heap.record(d).repr {
            Repr::Data(p) => p.contents.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(d).unwrap();

        // The record never owned the contents
        assert!(rt.heap.buffers.is_live(contents));
        assert_eq!(rt.heap.state(d), SlotState::Free);
    }

    #[test]
    fn typed_data_reads_release_strategy_from_descriptor() {
        static DEFERRED_TYPE: DataType = DataType {
            name: "handle",
            release: ReleaseHook::Finalizer(native_finalize),
        };
        let mut rt = runtime();
        let d = rt.new_typed_data(&DEFERRED_TYPE, 512);

        rt.force_free(d).unwrap();
        assert_eq!(rt.heap.state(d), SlotState::Deferred);

        static PLAIN_TYPE: DataType = DataType {
            name: "blob",
            release: ReleaseHook::Allocator,
        };
        let d2 = rt.new_typed_data(&PLAIN_TYPE, 512);
        rt.force_free(d2).unwrap();
        assert_eq!(rt.heap.state(d2), SlotState::Free);
    }

    #[test]
    fn frees_match_regions_offsets_and_record() {
        let mut rt = runtime();
        let m = rt.new_match(vec![MatchRegion { start: 0, end: 4 }], true);
        let (record, regions, offsets) = match &rt.heap.record(m).repr {
            Repr::MatchResult(p) => {
                let ext = p.ext.as_ref().unwrap();
                (ext.record, ext.regions, ext.char_offsets.unwrap())
            }
            _ => unreachable!(),
        };

        rt.force_free(m).unwrap();

        assert!(!rt.heap.buffers.is_live(record));
        assert!(!rt.heap.buffers.is_live(regions));
        assert!(!rt.heap.buffers.is_live(offsets));

        let empty = rt.new_empty_match();
        rt.force_free(empty).unwrap();
    }

    #[test]
    fn open_stream_is_always_deferred() {
        let mut rt = runtime();
        let s = rt.new_stream();
        let fptr = match &rt.heap.record(s).repr {
            Repr::Stream(p) => p.fptr.unwrap(),
            _ => unreachable!(),
        };

        rt.force_free(s).unwrap();

        assert_eq!(rt.heap.state(s), SlotState::Deferred);
        assert!(rt.heap.buffers.is_live(fptr));

        rt.run_deferred_finalizers();
        assert!(!rt.heap.buffers.is_live(fptr));
        assert_eq!(rt.heap.state(s), SlotState::Free);
    }

    #[test]
    fn closed_stream_recycles_synchronously() {
        let mut rt = runtime();
        let s = rt.new_closed_stream();

        rt.force_free(s).unwrap();
        assert_eq!(rt.heap.state(s), SlotState::Free);
        assert_eq!(rt.pending_finalizers(), 0);
    }

    #[test]
    fn frees_external_bigint_digits_only() {
        let mut rt = runtime();
        let small = rt.new_bigint(false, &[1, 2]);
        let big = rt.new_bigint(true, &[1, 2, 3, 4, 5]);
        let digits = match &rt.heap.record(big).repr {
            Repr::BigInt(p) => match p.digits {
                crate::repr::DigitStorage::External(d) => d,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        let before = rt.heap.stats().buffers.released;

        rt.force_free(small).unwrap();
        assert_eq!(rt.heap.stats().buffers.released, before);

        rt.force_free(big).unwrap();
        assert!(!rt.heap.buffers.is_live(digits));
    }

    #[test]
    fn frees_node_kind_specific_storage() {
        let mut rt = runtime();
        let name = rt.intern("x");
        let scope = rt.new_scope_node(vec![name]);
        let alloca = rt.new_alloca_node();
        let plain = rt.new_plain_node();
        let before = rt.heap.stats().buffers.released;

        rt.force_free(scope).unwrap();
        rt.force_free(alloca).unwrap();
        rt.force_free(plain).unwrap();

        assert_eq!(rt.heap.stats().buffers.released, before + 2);
    }

    #[test]
    fn frees_struct_external_fields_only() {
        let mut rt = runtime();
        let embedded = rt.new_struct(vec![ObjRef::from_fixnum(1)]);
        let spilled = rt.new_struct((0..10).map(ObjRef::from_fixnum).collect());
        let before = rt.heap.stats().buffers.released;

        rt.force_free(embedded).unwrap();
        assert_eq!(rt.heap.stats().buffers.released, before);

        rt.force_free(spilled).unwrap();
        assert_eq!(rt.heap.stats().buffers.released, before + 1);
    }

    #[test]
    fn numeric_kinds_are_noop_releases() {
        let mut rt = runtime();
        let f = rt.new_float(10.5);
        let r = rt.new_rational(ObjRef::from_fixnum(1), ObjRef::from_fixnum(2));
        let c = rt.new_complex(ObjRef::from_fixnum(1), ObjRef::from_fixnum(2));
        let before = rt.heap.stats().buffers.released;

        rt.force_free_all(&[f, r, c]).unwrap();

        assert_eq!(rt.heap.stats().buffers.released, before);
        assert_eq!(rt.heap.state(f), SlotState::Free);
    }
}
