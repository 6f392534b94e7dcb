//! Runtime - the host collaborators the force-free dispatcher consumes
//!
//! Owns the heap, the symbol table, the bootstrapped core class set, the
//! method-resolution cache and the deferred-finalization queue. Records are
//! only ever created here (the allocator/evaluator role); the force-free
//! dispatcher in [`crate::free`] only mutates them at end of life.
//!
//! Strictly single-threaded: every operation takes `&mut self`, exclusivity
//! across threads is the embedder's problem, exactly as the runtime's own
//! evaluator assumes.

pub mod cache;
pub mod deferred;

#[cfg(test)]
mod tests;

pub use cache::{CachedMethod, GlobalMethodCache, MethodCache, MethodFn, MethodTable};
pub use deferred::{native_finalize, stream_finalize, DeferredQueue};

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

use crate::error::FreeResult;
use crate::heap::{BufferData, Heap, Record, FL_SHARED};
use crate::object::{ObjRef, SymbolId};
use crate::repr::{
    ArrayPayload, BigIntPayload, ClassPayload, CompiledPattern, DataPayload, DataType,
    DigitStorage, FieldStorage, HashEntry, HashPayload, MatchExt, MatchPayload, MatchRegion,
    NativeBlock, NodePayload, ObjectPayload, PatternPayload, ReleaseHook, Repr, StreamPayload,
    StringPayload, StructPayload, TypedDataPayload, DIGIT_EMBED_CAPACITY, EMBED_CAPACITY,
};

/// Interned name table; symbols are immediate references into it
#[derive(Default)]
pub struct SymbolTable {
    names: Vec<String>,
    ids: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.names[id.0 as usize]
    }
}

/// The runtime-critical singleton classes created at bootstrap.
///
/// Force-freeing any of these would corrupt the runtime's own invariants,
/// so the dispatcher rejects them up front.
pub struct CoreClasses {
    pub object: ObjRef,
    pub module: ObjRef,
    pub class: ObjRef,
    pub symbol: ObjRef,
    pub numeric: ObjRef,
    pub integer: ObjRef,
    pub fixnum: ObjRef,
    pub bignum: ObjRef,
    pub float: ObjRef,
    pub string: ObjRef,
    pub pattern: ObjRef,
    pub array: ObjRef,
    pub nil_class: ObjRef,
    pub true_class: ObjRef,
    pub false_class: ObjRef,
    pub struct_class: ObjRef,
}

impl CoreClasses {
    pub fn all(&self) -> [ObjRef; 16] {
        [
            self.object,
            self.module,
            self.class,
            self.symbol,
            self.numeric,
            self.integer,
            self.fixnum,
            self.bignum,
            self.float,
            self.string,
            self.pattern,
            self.array,
            self.nil_class,
            self.true_class,
            self.false_class,
            self.struct_class,
        ]
    }

    /// Membership check for the fixed critical singleton set
    pub fn is_critical(&self, obj: ObjRef) -> bool {
        self.all().contains(&obj)
    }
}

/// The Nyx runtime core
pub struct Runtime {
    pub heap: Heap,
    symbols: SymbolTable,
    core: CoreClasses,
    pub(crate) cache: Box<dyn MethodCache>,
    pub(crate) deferred: DeferredQueue,
    /// Slots currently mid-teardown; guards destructor-hook re-entry
    pub(crate) tearing_down: HashSet<u32>,
    /// Lazily-created classes for kinds without a bootstrap singleton
    kind_classes: HashMap<SymbolId, ObjRef>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_method_cache(Box::new(GlobalMethodCache::new()))
    }

    /// Build a runtime around an injected method-cache service
    pub fn with_method_cache(cache: Box<dyn MethodCache>) -> Self {
        let mut heap = Heap::new();
        let core = bootstrap_core_classes(&mut heap);
        Self {
            heap,
            symbols: SymbolTable::default(),
            core,
            cache,
            deferred: DeferredQueue::new(),
            tearing_down: HashSet::new(),
            kind_classes: HashMap::new(),
        }
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn symbol_name(&self, id: SymbolId) -> &str {
        self.symbols.name(id)
    }

    /// Class of any reference, immediates included
    pub fn class_of(&self, obj: ObjRef) -> ObjRef {
        if obj.is_heap() {
            return self.heap.record(obj).class;
        }
        if obj.is_fixnum() {
            self.core.fixnum
        } else if obj.is_symbol() {
            self.core.symbol
        } else if obj.is_nil() {
            self.core.nil_class
        } else if obj.is_true() {
            self.core.true_class
        } else {
            self.core.false_class
        }
    }

    // ------------------------------------------------------------------
    // Method dispatch
    // ------------------------------------------------------------------

    /// Define (or redefine) a method on a class or module
    pub fn define_method(&mut self, class: ObjRef, name: SymbolId, body: MethodFn) {
        let methods = self.class_payload(class).methods;
        match self.heap.buffers.get_mut(methods) {
            BufferData::Methods(table) => {
                table.insert(name, body);
            }
            _ => crate::error::buffer_kind_mismatch(methods.0, "methods"),
        }
        // Redefinition must not leave a stale resolution behind
        self.cache.invalidate_class(class);
    }

    /// Whether the object responds to the named method
    pub fn responds_to(&mut self, obj: ObjRef, name: SymbolId) -> bool {
        let class = self.class_of(obj);
        self.resolve(class, name).is_some()
    }

    /// Invoke the named method on the object, if defined
    pub fn invoke(&mut self, obj: ObjRef, name: SymbolId) -> Option<ObjRef> {
        let class = self.class_of(obj);
        let body = self.resolve(class, name)?;
        Some(body(self, obj))
    }

    /// Resolve a method through the superclass chain, consulting the cache
    pub fn resolve(&mut self, class: ObjRef, name: SymbolId) -> Option<MethodFn> {
        if let Some(hit) = self.cache.lookup(class, name) {
            return Some(hit.body);
        }
        let (origin, body) = self.resolve_uncached(class, name)?;
        self.cache.insert(
            class,
            name,
            CachedMethod {
                origin,
                body: body.clone(),
            },
        );
        Some(body)
    }

    fn resolve_uncached(&self, mut class: ObjRef, name: SymbolId) -> Option<(ObjRef, MethodFn)> {
        while class.is_heap() {
            // A force-freed ancestor severs the chain; resolution must not
            // read through its recycled slot.
            if self.heap.state(class) != crate::heap::SlotState::Live {
                tracing::warn!(
                    slot = class.as_slot(),
                    "method resolution hit a recycled class; chain severed"
                );
                return None;
            }
            let record = self.heap.record(class);
            let payload = match &record.repr {
                Repr::Class(p) | Repr::Module(p) => p,
                _ => return None,
            };
            if let BufferData::Methods(table) = self.heap.buffers.get(payload.methods) {
                if let Some(body) = table.get(&name) {
                    return Some((class, body.clone()));
                }
            }
            class = payload.superclass;
        }
        None
    }

    fn class_payload(&self, class: ObjRef) -> &ClassPayload {
        match &self.heap.record(class).repr {
            Repr::Class(p) | Repr::Module(p) => p,
            other => panic!("expected class or module, found {}", other.kind_name()),
        }
    }

    // ------------------------------------------------------------------
    // Force-free surface
    // ------------------------------------------------------------------

    /// Force-free a single object; see [`crate::free::force_free`]
    pub fn force_free(&mut self, obj: ObjRef) -> FreeResult<ObjRef> {
        crate::free::force_free(self, obj)
    }

    /// Force-free a batch of objects; see [`crate::free::force_free_all`]
    pub fn force_free_all(&mut self, objs: &[ObjRef]) -> FreeResult<()> {
        crate::free::force_free_all(self, objs)
    }

    /// Run the deferred-finalization pass, invoking each stashed callback
    /// exactly once and recycling the slots. Returns the count finalized.
    pub fn run_deferred_finalizers(&mut self) -> usize {
        self.deferred.run(&mut self.heap)
    }

    pub fn pending_finalizers(&self) -> usize {
        self.deferred.len()
    }

    // ------------------------------------------------------------------
    // Constructors (the allocator/evaluator role)
    // ------------------------------------------------------------------

    /// Create a class inheriting from the given superclass
    pub fn new_class(&mut self, superclass: ObjRef) -> ObjRef {
        let payload = alloc_class_payload(&mut self.heap, superclass);
        self.heap
            .alloc(Record::new(self.core.class, Repr::Class(payload)))
    }

    /// Create a module
    pub fn new_module(&mut self) -> ObjRef {
        let payload = alloc_class_payload(&mut self.heap, ObjRef::nil());
        self.heap
            .alloc(Record::new(self.core.module, Repr::Module(payload)))
    }

    /// Attach an instance-attribute table to a class
    pub fn attach_class_attrs(&mut self, class: ObjRef, attrs: Vec<(SymbolId, ObjRef)>) {
        let index: HashMap<SymbolId, u32> = attrs
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (*name, i as u32))
            .collect();
        let values: Vec<ObjRef> = attrs.iter().map(|(_, v)| *v).collect();
        let attrs_buf = self.heap.buffers.alloc(BufferData::Refs(values));
        let index_buf = self.heap.buffers.alloc(BufferData::NameIndex(index));
        match &mut self.heap.record_mut(class).repr {
            Repr::Class(p) | Repr::Module(p) => {
                p.attrs = Some(attrs_buf);
                p.attr_index = Some(index_buf);
            }
            other => panic!("expected class or module, found {}", other.kind_name()),
        }
    }

    /// Create a plain object with embedded attribute storage
    pub fn new_object(&mut self, class: ObjRef) -> ObjRef {
        self.heap.alloc(Record::new(
            class,
            Repr::Object(ObjectPayload {
                attrs: FieldStorage::Embedded(SmallVec::new()),
            }),
        ))
    }

    /// Create a plain object; attribute values spill to a heap buffer past
    /// the embed threshold
    pub fn new_object_with_attrs(&mut self, class: ObjRef, attrs: Vec<ObjRef>) -> ObjRef {
        let storage = self.alloc_field_storage(attrs);
        self.heap.alloc(Record::new(
            class,
            Repr::Object(ObjectPayload { attrs: storage }),
        ))
    }

    /// Store an attribute in the object's extended overflow table
    pub fn set_extended_attr(&mut self, obj: ObjRef, name: SymbolId, value: ObjRef) {
        let entry = HashEntry {
            hash: hash_key(ObjRef::from_symbol(name)),
            key: ObjRef::from_symbol(name),
            value,
        };
        match self.heap.extended_attrs(obj) {
            Some(table) => match self.heap.buffers.get_mut(table) {
                BufferData::Entries(entries) => entries.push(entry),
                _ => crate::error::buffer_kind_mismatch(table.0, "entries"),
            },
            None => {
                let table = self.heap.buffers.alloc(BufferData::Entries(vec![entry]));
                self.heap.set_extended_attrs(obj, table);
            }
        }
    }

    /// Create a byte string
    pub fn new_string(&mut self, text: &str) -> ObjRef {
        let buf = self
            .heap
            .buffers
            .alloc(BufferData::Bytes(text.as_bytes().to_vec()));
        self.heap.alloc(Record::new(
            self.core.string,
            Repr::ByteString(StringPayload {
                buf,
                len: text.len(),
            }),
        ))
    }

    /// Create a copy-on-write view sharing another string's character buffer
    pub fn new_shared_string(&mut self, origin: ObjRef) -> ObjRef {
        let (buf, len) = match &self.heap.record(origin).repr {
            Repr::ByteString(p) => (p.buf, p.len),
            other => panic!("expected string, found {}", other.kind_name()),
        };
        self.heap.buffers.retain(buf);
        let view = self.heap.alloc(Record::new(
            self.core.string,
            Repr::ByteString(StringPayload { buf, len }),
        ));
        self.heap.record_mut(view).flags |= FL_SHARED;
        view
    }

    /// Borrow string contents
    pub fn string_text(&self, obj: ObjRef) -> &str {
        match &self.heap.record(obj).repr {
            Repr::ByteString(p) => match self.heap.buffers.get(p.buf) {
                BufferData::Bytes(bytes) => match std::str::from_utf8(&bytes[..p.len]) {
                    Ok(text) => text,
                    Err(_) => crate::error::buffer_kind_mismatch(p.buf.0, "valid utf-8"),
                },
                _ => crate::error::buffer_kind_mismatch(p.buf.0, "bytes"),
            },
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    /// Create a contiguous array
    pub fn new_array(&mut self, elements: Vec<ObjRef>) -> ObjRef {
        let len = elements.len();
        let buf = self.heap.buffers.alloc(BufferData::Refs(elements));
        self.heap.alloc(Record::new(
            self.core.array,
            Repr::Array(ArrayPayload { buf, len }),
        ))
    }

    /// Create a view sharing another array's element buffer
    pub fn new_shared_array(&mut self, origin: ObjRef) -> ObjRef {
        let (buf, len) = match &self.heap.record(origin).repr {
            Repr::Array(p) => (p.buf, p.len),
            other => panic!("expected array, found {}", other.kind_name()),
        };
        self.heap.buffers.retain(buf);
        let view = self.heap.alloc(Record::new(
            self.core.array,
            Repr::Array(ArrayPayload { buf, len }),
        ));
        self.heap.record_mut(view).flags |= FL_SHARED;
        view
    }

    /// Create a hash; empty hashes carry no backing table
    pub fn new_hash(&mut self, pairs: Vec<(ObjRef, ObjRef)>) -> ObjRef {
        let table = if pairs.is_empty() {
            None
        } else {
            let entries: Vec<HashEntry> = pairs
                .into_iter()
                .map(|(key, value)| HashEntry {
                    hash: hash_key(key),
                    key,
                    value,
                })
                .collect();
            Some(self.heap.buffers.alloc(BufferData::Entries(entries)))
        };
        let class = self.class_for_kind("Hash");
        self.heap
            .alloc(Record::new(class, Repr::Hash(HashPayload { table })))
    }

    /// Create a compiled pattern
    pub fn new_pattern(&mut self, source: &str) -> ObjRef {
        let compiled = CompiledPattern {
            program: source.as_bytes().to_vec(),
            group_count: source.bytes().filter(|b| *b == b'(').count(),
        };
        let buf = self.heap.buffers.alloc(BufferData::Pattern(compiled));
        self.heap.alloc(Record::new(
            self.core.pattern,
            Repr::Pattern(PatternPayload {
                compiled: Some(buf),
            }),
        ))
    }

    /// Create a pattern whose engine state has not been built yet
    pub fn new_empty_pattern(&mut self) -> ObjRef {
        self.heap.alloc(Record::new(
            self.core.pattern,
            Repr::Pattern(PatternPayload { compiled: None }),
        ))
    }

    /// Create generic boxed native data with the given release strategy
    pub fn new_data(&mut self, size: usize, release: ReleaseHook) -> ObjRef {
        let class = self.class_for_kind("Data");
        let contents = Some(self.heap.buffers.alloc(BufferData::Native(NativeBlock { size })));
        self.heap
            .alloc(Record::new(class, Repr::Data(DataPayload { contents, release })))
    }

    /// Create boxed native data with no contents pointer
    pub fn new_empty_data(&mut self, release: ReleaseHook) -> ObjRef {
        let class = self.class_for_kind("Data");
        self.heap.alloc(Record::new(
            class,
            Repr::Data(DataPayload {
                contents: None,
                release,
            }),
        ))
    }

    /// Create typed boxed native data described by a static type descriptor
    pub fn new_typed_data(&mut self, ty: &'static DataType, size: usize) -> ObjRef {
        let class = self.class_for_kind("Data");
        let contents = Some(self.heap.buffers.alloc(BufferData::Native(NativeBlock { size })));
        self.heap
            .alloc(Record::new(class, Repr::TypedData(TypedDataPayload { contents, ty })))
    }

    /// Create a match result with a region buffer and optional offsets
    pub fn new_match(&mut self, regions: Vec<MatchRegion>, with_char_offsets: bool) -> ObjRef {
        let record = self.heap.buffers.alloc(BufferData::Native(NativeBlock {
            size: std::mem::size_of::<MatchExt>(),
        }));
        let offsets = if with_char_offsets {
            let offsets = regions.iter().map(|r| r.start).collect();
            Some(self.heap.buffers.alloc(BufferData::CharOffsets(offsets)))
        } else {
            None
        };
        let regions = self.heap.buffers.alloc(BufferData::Regions(regions));
        let class = self.class_for_kind("MatchResult");
        self.heap.alloc(Record::new(
            class,
            Repr::MatchResult(MatchPayload {
                ext: Some(MatchExt {
                    record,
                    regions,
                    char_offsets: offsets,
                }),
            }),
        ))
    }

    /// Create a match result that never matched (no extension allocated)
    pub fn new_empty_match(&mut self) -> ObjRef {
        let class = self.class_for_kind("MatchResult");
        self.heap
            .alloc(Record::new(class, Repr::MatchResult(MatchPayload { ext: None })))
    }

    /// Create an open stream with live descriptor state
    pub fn new_stream(&mut self) -> ObjRef {
        let class = self.class_for_kind("Stream");
        let fptr = Some(self.heap.buffers.alloc(BufferData::Native(NativeBlock {
            size: 128,
        })));
        self.heap
            .alloc(Record::new(class, Repr::Stream(StreamPayload { fptr })))
    }

    /// Create a stream whose descriptor state is already gone
    pub fn new_closed_stream(&mut self) -> ObjRef {
        let class = self.class_for_kind("Stream");
        self.heap
            .alloc(Record::new(class, Repr::Stream(StreamPayload { fptr: None })))
    }

    /// Create a big integer; digits spill to the heap past the embed limit
    pub fn new_bigint(&mut self, negative: bool, magnitude: &[u32]) -> ObjRef {
        let digits = if magnitude.len() <= DIGIT_EMBED_CAPACITY {
            DigitStorage::Embedded(SmallVec::from_slice(magnitude))
        } else {
            DigitStorage::External(
                self.heap
                    .buffers
                    .alloc(BufferData::Digits(magnitude.to_vec())),
            )
        };
        self.heap.alloc(Record::new(
            self.core.bignum,
            Repr::BigInt(BigIntPayload { negative, digits }),
        ))
    }

    /// Create a scope parser node with a local symbol table
    pub fn new_scope_node(&mut self, locals: Vec<SymbolId>) -> ObjRef {
        let class = self.class_for_kind("Node");
        let locals = if locals.is_empty() {
            None
        } else {
            Some(self.heap.buffers.alloc(BufferData::Locals(locals)))
        };
        self.heap
            .alloc(Record::new(class, Repr::Node(NodePayload::Scope { locals })))
    }

    /// Create a parser node owning a single child allocation
    pub fn new_alloca_node(&mut self) -> ObjRef {
        let class = self.class_for_kind("Node");
        let child = self.heap.buffers.alloc(BufferData::Native(NativeBlock {
            size: 64,
        }));
        self.heap
            .alloc(Record::new(class, Repr::Node(NodePayload::Alloca { child })))
    }

    /// Create a parser node with no auxiliary storage
    pub fn new_plain_node(&mut self) -> ObjRef {
        let class = self.class_for_kind("Node");
        self.heap
            .alloc(Record::new(class, Repr::Node(NodePayload::Plain)))
    }

    /// Create an aggregate; fields spill to the heap past the embed limit
    pub fn new_struct(&mut self, fields: Vec<ObjRef>) -> ObjRef {
        let storage = self.alloc_field_storage(fields);
        self.heap.alloc(Record::new(
            self.core.struct_class,
            Repr::Struct(StructPayload { fields: storage }),
        ))
    }

    /// Create a boxed float
    pub fn new_float(&mut self, value: f64) -> ObjRef {
        self.heap
            .alloc(Record::new(self.core.float, Repr::Float(value)))
    }

    /// Create a rational number
    pub fn new_rational(&mut self, num: ObjRef, den: ObjRef) -> ObjRef {
        self.heap.alloc(Record::new(
            self.core.numeric,
            Repr::Rational { num, den },
        ))
    }

    /// Create a complex number
    pub fn new_complex(&mut self, real: ObjRef, imag: ObjRef) -> ObjRef {
        self.heap.alloc(Record::new(
            self.core.numeric,
            Repr::Complex { real, imag },
        ))
    }

    fn alloc_field_storage(&mut self, values: Vec<ObjRef>) -> FieldStorage {
        if values.len() <= EMBED_CAPACITY {
            FieldStorage::Embedded(SmallVec::from_vec(values))
        } else {
            FieldStorage::External(self.heap.buffers.alloc(BufferData::Refs(values)))
        }
    }

    /// Lazily-created non-critical class for kinds without a bootstrap slot
    fn class_for_kind(&mut self, name: &str) -> ObjRef {
        // Not part of the critical set; a fresh subclass of Object per call
        // would churn slots, so intern one per kind name.
        let sym = self.symbols.intern(name);
        if let Some(existing) = self.kind_classes_get(sym) {
            return existing;
        }
        let class = self.new_class(self.core.object);
        self.kind_classes_insert(sym, class);
        class
    }

    fn kind_classes_get(&self, sym: SymbolId) -> Option<ObjRef> {
        self.kind_classes.get(&sym).copied()
    }

    fn kind_classes_insert(&mut self, sym: SymbolId, class: ObjRef) {
        self.kind_classes.insert(sym, class);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_key(key: ObjRef) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn alloc_class_payload(heap: &mut Heap, superclass: ObjRef) -> ClassPayload {
    let methods = heap.buffers.alloc(BufferData::Methods(MethodTable::new()));
    let ext = heap.buffers.alloc(BufferData::Native(NativeBlock { size: 64 }));
    ClassPayload {
        superclass,
        methods,
        attrs: None,
        attr_index: None,
        ext,
    }
}

fn bootstrap_core_classes(heap: &mut Heap) -> CoreClasses {
    let class_record = |heap: &mut Heap, superclass: ObjRef| {
        let payload = alloc_class_payload(heap, superclass);
        heap.alloc(Record::new(ObjRef::nil(), Repr::Class(payload)))
    };

    let object = class_record(heap, ObjRef::nil());
    let module = class_record(heap, object);
    let class = class_record(heap, module);

    let symbol = class_record(heap, object);
    let numeric = class_record(heap, object);
    let integer = class_record(heap, numeric);
    let fixnum = class_record(heap, integer);
    let bignum = class_record(heap, integer);
    let float = class_record(heap, numeric);
    let string = class_record(heap, object);
    let pattern = class_record(heap, object);
    let array = class_record(heap, object);
    let nil_class = class_record(heap, object);
    let true_class = class_record(heap, object);
    let false_class = class_record(heap, object);
    let struct_class = class_record(heap, object);

    let core = CoreClasses {
        object,
        module,
        class,
        symbol,
        numeric,
        integer,
        fixnum,
        bignum,
        float,
        string,
        pattern,
        array,
        nil_class,
        true_class,
        false_class,
        struct_class,
    };

    // Every class is an instance of Class, including Class itself
    for singleton in core.all() {
        heap.record_mut(singleton).class = class;
    }

    core
}
