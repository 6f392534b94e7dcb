//! Representation catalog - one payload shape per heap object kind
//!
//! [`Repr`] is the closed tagged union backing every heap object. Exactly
//! one variant is valid per record; the force-free dispatcher matches it
//! exhaustively, so an unhandled representation kind is a compile error
//! rather than a runtime trap.
//!
//! Payloads own zero or more auxiliary allocations through [`BufferId`]s.
//! Small payloads keep their data embedded inline in the record
//! (`SmallVec` below the spill threshold) and only spill to a tracked
//! buffer past it; teardown releases external storage only.

use smallvec::SmallVec;

use crate::heap::{BufferId, BufferTable, FL_SHARED};
use crate::object::ObjRef;

/// Inline capacity before attribute/field storage spills to the heap
pub const EMBED_CAPACITY: usize = 3;
/// Inline capacity before big-integer digits spill to the heap
pub const DIGIT_EMBED_CAPACITY: usize = 2;

/// One entry in a hash backing table
#[derive(Debug, Clone, Copy)]
pub struct HashEntry {
    pub hash: u64,
    pub key: ObjRef,
    pub value: ObjRef,
}

/// Compiled pattern engine state
pub struct CompiledPattern {
    pub program: Vec<u8>,
    pub group_count: usize,
}

/// One captured region of a match result
#[derive(Debug, Clone, Copy)]
pub struct MatchRegion {
    pub start: usize,
    pub end: usize,
}

/// Opaque native allocation (boxed data contents, stream descriptor state,
/// class extended allocation blocks)
#[derive(Debug, Clone, Copy)]
pub struct NativeBlock {
    pub size: usize,
}

/// How a boxed native payload is released.
///
/// Replaces the classic sentinel encoding (a magic function-pointer value
/// meaning "use the generic allocator") with an explicit strategy:
/// - `None`: the record does not own the contents; nothing to release
/// - `Allocator`: contents are a plain allocation, released synchronously
///   through the generic allocator
/// - `Finalizer`: release requires coordination the collector normally
///   guarantees; the record is converted to deferred finalization and the
///   callback runs later, never synchronously
#[derive(Clone, Copy)]
pub enum ReleaseHook {
    None,
    Allocator,
    Finalizer(crate::heap::NativeFinalizer),
}

/// Static descriptor for typed boxed native data
pub struct DataType {
    pub name: &'static str,
    pub release: ReleaseHook,
}

/// Attribute/field storage: embedded inline or spilled to a refs buffer
pub enum FieldStorage {
    Embedded(SmallVec<[ObjRef; EMBED_CAPACITY]>),
    External(BufferId),
}

/// Plain-attribute object
pub struct ObjectPayload {
    pub attrs: FieldStorage,
}

/// Class or module
pub struct ClassPayload {
    pub superclass: ObjRef,
    /// Method lookup table (always allocated, possibly empty)
    pub methods: BufferId,
    /// Instance attribute table
    pub attrs: Option<BufferId>,
    /// Attribute-name-to-index table
    pub attr_index: Option<BufferId>,
    /// Extended class allocation block
    pub ext: BufferId,
}

/// Byte string
pub struct StringPayload {
    pub buf: BufferId,
    pub len: usize,
}

/// Contiguous array
pub struct ArrayPayload {
    pub buf: BufferId,
    pub len: usize,
}

/// Hash/dictionary
pub struct HashPayload {
    /// Lazily allocated; empty hashes have no backing table
    pub table: Option<BufferId>,
}

/// Compiled pattern
pub struct PatternPayload {
    pub compiled: Option<BufferId>,
}

/// Generic boxed native data
pub struct DataPayload {
    pub contents: Option<BufferId>,
    pub release: ReleaseHook,
}

/// Typed boxed native data; the release strategy lives on the static type
/// descriptor rather than the record
pub struct TypedDataPayload {
    pub contents: Option<BufferId>,
    pub ty: &'static DataType,
}

/// Match result extension (regions, offsets, and the match record block)
pub struct MatchExt {
    pub record: BufferId,
    pub regions: BufferId,
    pub char_offsets: Option<BufferId>,
}

/// Pattern match result
pub struct MatchPayload {
    pub ext: Option<MatchExt>,
}

/// Open stream; the descriptor state can never be released synchronously
pub struct StreamPayload {
    pub fptr: Option<BufferId>,
}

/// Big integer digit storage
pub enum DigitStorage {
    Embedded(SmallVec<[u32; DIGIT_EMBED_CAPACITY]>),
    External(BufferId),
}

/// Arbitrary precision integer
pub struct BigIntPayload {
    pub negative: bool,
    pub digits: DigitStorage,
}

/// Parser node
pub enum NodePayload {
    /// Scope node with an optional local symbol table
    Scope { locals: Option<BufferId> },
    /// Node subkind owning a single child allocation
    Alloca { child: BufferId },
    /// All other node kinds carry no auxiliary storage
    Plain,
}

/// Aggregate/struct
pub struct StructPayload {
    pub fields: FieldStorage,
}

/// Internal representation of one heap object.
///
/// The tag is authoritative: it is what the force-free dispatcher reads to
/// decide which auxiliary allocations must be released. Every kind the
/// runtime defines has a variant here and a teardown arm in the dispatcher.
pub enum Repr {
    Object(ObjectPayload),
    Class(ClassPayload),
    Module(ClassPayload),
    ByteString(StringPayload),
    Array(ArrayPayload),
    Hash(HashPayload),
    Pattern(PatternPayload),
    Data(DataPayload),
    TypedData(TypedDataPayload),
    MatchResult(MatchPayload),
    Stream(StreamPayload),
    BigInt(BigIntPayload),
    Node(NodePayload),
    Struct(StructPayload),
    Float(f64),
    Rational { num: ObjRef, den: ObjRef },
    Complex { real: ObjRef, imag: ObjRef },
}

impl Repr {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Repr::Object(_) => "object",
            Repr::Class(_) => "class",
            Repr::Module(_) => "module",
            Repr::ByteString(_) => "string",
            Repr::Array(_) => "array",
            Repr::Hash(_) => "hash",
            Repr::Pattern(_) => "pattern",
            Repr::Data(_) => "data",
            Repr::TypedData(_) => "typed_data",
            Repr::MatchResult(_) => "match",
            Repr::Stream(_) => "stream",
            Repr::BigInt(_) => "bigint",
            Repr::Node(_) => "node",
            Repr::Struct(_) => "struct",
            Repr::Float(_) => "float",
            Repr::Rational { .. } => "rational",
            Repr::Complex { .. } => "complex",
        }
    }
}

impl StringPayload {
    /// Release the character buffer reference. Shared views and their owner
    /// each hold one counted reference; the bytes are deallocated when the
    /// last holder lets go, so a view never frees storage the owner still
    /// reads.
    pub fn release(&self, flags: u32, buffers: &mut BufferTable) {
        if flags & FL_SHARED != 0 {
            tracing::trace!(buffer = self.buf.0, "releasing shared string view");
        }
        buffers.release(self.buf);
    }
}

impl ArrayPayload {
    /// Release the element buffer reference (shared-view aware, as for
    /// strings).
    pub fn release(&self, flags: u32, buffers: &mut BufferTable) {
        if flags & FL_SHARED != 0 {
            tracing::trace!(buffer = self.buf.0, "releasing shared array view");
        }
        buffers.release(self.buf);
    }
}
