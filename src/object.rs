//! Object references - unified tagged representation for all Nyx values
//!
//! Design: one machine word per reference, immediates encoded inline:
//! - Heap references carry a slot index (no raw pointers; slots are
//!   indices into the runtime heap's slot arena)
//! - Fixnums inline (61-bit on 64-bit systems)
//! - Symbols inline (interned id)
//! - nil/true/false as tagged specials

/// Tagged encoding for object references
///
/// Layout (64-bit):
/// - Bits 0-1 = 00: heap slot reference (slot index in bits 3-63)
/// - Bits 0-1 = 01: fixnum (signed, bits 3-63)
/// - Bits 0-1 = 10: symbol (interned id in bits 2-63)
/// - Bits 0-1 = 11: special (nil/true/false, code in bits 2-7)
const TAG_MASK: usize = 0b11;
const SLOT_TAG: usize = 0b00;
const INT_TAG: usize = 0b01;
const SYM_TAG: usize = 0b10;
const SPECIAL_TAG: usize = 0b11;

const SPECIAL_SHIFT: usize = 2;
const SPECIAL_NIL: usize = 0;
const SPECIAL_TRUE: usize = 1;
const SPECIAL_FALSE: usize = 2;

const VALUE_SHIFT: usize = 3;

/// Largest magnitude representable as an inline fixnum.
pub const FIXNUM_MAX: i64 = (1i64 << 60) - 1;
pub const FIXNUM_MIN: i64 = -(1i64 << 60);

/// Interned symbol identifier (index into the runtime's symbol table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// Universal Nyx object reference (one word)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    bits: usize,
}

impl ObjRef {
    /// Create a reference to a heap slot
    #[inline]
    pub fn from_slot(slot: u32) -> Self {
        Self {
            bits: ((slot as usize) << VALUE_SHIFT) | SLOT_TAG,
        }
    }

    /// Create an inline fixnum (value must fit the 61-bit range)
    #[inline]
    pub fn from_fixnum(val: i64) -> Self {
        debug_assert!((FIXNUM_MIN..=FIXNUM_MAX).contains(&val), "fixnum overflow");
        Self {
            bits: ((val as usize) << VALUE_SHIFT) | INT_TAG,
        }
    }

    /// Create an interned symbol reference
    #[inline]
    pub fn from_symbol(sym: SymbolId) -> Self {
        Self {
            bits: ((sym.0 as usize) << SPECIAL_SHIFT) | SYM_TAG,
        }
    }

    /// Create a boolean
    #[inline]
    pub const fn from_bool(val: bool) -> Self {
        let code = if val { SPECIAL_TRUE } else { SPECIAL_FALSE };
        Self {
            bits: (code << SPECIAL_SHIFT) | SPECIAL_TAG,
        }
    }

    /// Create nil
    #[inline]
    pub const fn nil() -> Self {
        Self {
            bits: (SPECIAL_NIL << SPECIAL_SHIFT) | SPECIAL_TAG,
        }
    }

    /// Check if this reference denotes a heap record
    #[inline]
    pub fn is_heap(self) -> bool {
        (self.bits & TAG_MASK) == SLOT_TAG
    }

    /// Check if this is any immediate value (no heap representation)
    #[inline]
    pub fn is_immediate(self) -> bool {
        !self.is_heap()
    }

    #[inline]
    pub fn is_fixnum(self) -> bool {
        (self.bits & TAG_MASK) == INT_TAG
    }

    #[inline]
    pub fn is_symbol(self) -> bool {
        (self.bits & TAG_MASK) == SYM_TAG
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.bits == (SPECIAL_NIL << SPECIAL_SHIFT) | SPECIAL_TAG
    }

    #[inline]
    pub fn is_true(self) -> bool {
        self.bits == (SPECIAL_TRUE << SPECIAL_SHIFT) | SPECIAL_TAG
    }

    #[inline]
    pub fn is_false(self) -> bool {
        self.bits == (SPECIAL_FALSE << SPECIAL_SHIFT) | SPECIAL_TAG
    }

    /// Extract the heap slot index (callers must check `is_heap` first)
    #[inline]
    pub fn as_slot(self) -> u32 {
        debug_assert!(self.is_heap());
        (self.bits >> VALUE_SHIFT) as u32
    }

    /// Extract the fixnum value
    #[inline]
    pub fn as_fixnum(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.bits as i64) >> VALUE_SHIFT
    }

    /// Extract the symbol id
    #[inline]
    pub fn as_symbol(self) -> SymbolId {
        debug_assert!(self.is_symbol());
        SymbolId((self.bits >> SPECIAL_SHIFT) as u32)
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bits & TAG_MASK {
            SLOT_TAG => write!(f, "ObjRef(slot {})", self.as_slot()),
            INT_TAG => write!(f, "ObjRef(fixnum {})", self.as_fixnum()),
            SYM_TAG => write!(f, "ObjRef(symbol {})", self.as_symbol().0),
            _ => match (self.bits >> SPECIAL_SHIFT) & 0b111111 {
                SPECIAL_NIL => write!(f, "ObjRef(nil)"),
                SPECIAL_TRUE => write!(f, "ObjRef(true)"),
                SPECIAL_FALSE => write!(f, "ObjRef(false)"),
                other => write!(f, "ObjRef(special {other})"),
            },
        }
    }
}
