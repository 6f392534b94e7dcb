//! Method-resolution cache - injected service for dispatch teardown
//!
//! The cache maps (receiver class, method name) to the resolved method and
//! the class the resolution came from. Class teardown must invalidate
//! before the class's method table is released, otherwise a later lookup
//! on a still-live subclass could resolve through freed storage. The cache
//! is a capability-scoped service behind a trait so the dispatcher can be
//! exercised against a spy in tests.

use std::collections::HashMap;
use std::rc::Rc;

use crate::object::{ObjRef, SymbolId};
use crate::runtime::Runtime;

/// A method body; hooks and test doubles are plain Rust closures
pub type MethodFn = Rc<dyn Fn(&mut Runtime, ObjRef) -> ObjRef>;

/// Per-class method lookup table (lives in a tracked buffer)
pub type MethodTable = HashMap<SymbolId, MethodFn>;

/// A cache entry: the resolved body plus the class it was found on
#[derive(Clone)]
pub struct CachedMethod {
    /// Class whose method table the resolution came from (an ancestor of,
    /// or equal to, the lookup class)
    pub origin: ObjRef,
    pub body: MethodFn,
}

/// Method-resolution cache service
pub trait MethodCache {
    fn lookup(&self, class: ObjRef, name: SymbolId) -> Option<CachedMethod>;
    fn insert(&mut self, class: ObjRef, name: SymbolId, entry: CachedMethod);
    /// Drop every entry keyed by the class or whose resolution originated
    /// on it. Entries that merely walked through the class on the way to an
    /// ancestor are untouched. Must run before the class's method table is
    /// released.
    fn invalidate_class(&mut self, class: ObjRef);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default runtime-wide cache implementation
#[derive(Default)]
pub struct GlobalMethodCache {
    map: HashMap<(ObjRef, SymbolId), CachedMethod>,
}

impl GlobalMethodCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MethodCache for GlobalMethodCache {
    fn lookup(&self, class: ObjRef, name: SymbolId) -> Option<CachedMethod> {
        self.map.get(&(class, name)).cloned()
    }

    fn insert(&mut self, class: ObjRef, name: SymbolId, entry: CachedMethod) {
        self.map.insert((class, name), entry);
    }

    fn invalidate_class(&mut self, class: ObjRef) {
        let before = self.map.len();
        self.map
            .retain(|(lookup, _), entry| *lookup != class && entry.origin != class);
        crate::logging::log_cache_invalidated(class.as_slot(), before - self.map.len());
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
