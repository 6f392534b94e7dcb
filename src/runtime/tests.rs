use super::*;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn interning_is_stable() {
    let mut rt = Runtime::new();
    let a = rt.intern("__destruct__");
    let b = rt.intern("__destruct__");
    let c = rt.intern("other");

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(rt.symbol_name(a), "__destruct__");
}

#[test]
fn bootstrap_creates_the_critical_singleton_set() {
    let rt = Runtime::new();
    let core = rt.core();

    assert_eq!(core.all().len(), 16);
    for singleton in core.all() {
        assert!(core.is_critical(singleton));
        assert_eq!(rt.heap.state(singleton), crate::heap::SlotState::Live);
    }

    let not_critical = ObjRef::from_fixnum(3);
    assert!(!core.is_critical(not_critical));
}

#[test]
fn class_of_immediates() {
    let rt = Runtime::new();
    assert_eq!(rt.class_of(ObjRef::nil()), rt.core().nil_class);
    assert_eq!(rt.class_of(ObjRef::from_bool(true)), rt.core().true_class);
    assert_eq!(rt.class_of(ObjRef::from_bool(false)), rt.core().false_class);
    assert_eq!(rt.class_of(ObjRef::from_fixnum(5)), rt.core().fixnum);
    assert_eq!(
        rt.class_of(ObjRef::from_symbol(SymbolId(0))),
        rt.core().symbol
    );
}

#[test]
fn method_resolution_walks_the_superclass_chain() {
    let mut rt = Runtime::new();
    let parent = rt.new_class(rt.core().object);
    let child = rt.new_class(parent);
    let name = rt.intern("greet");
    rt.define_method(parent, name, Rc::new(|_, _| ObjRef::from_fixnum(7)));

    let obj = rt.new_object(child);
    assert!(rt.responds_to(obj, name));
    assert_eq!(rt.invoke(obj, name), Some(ObjRef::from_fixnum(7)));

    let missing = rt.intern("absent");
    assert!(!rt.responds_to(obj, missing));
    assert_eq!(rt.invoke(obj, missing), None);
}

#[test]
fn resolution_results_are_cached_and_redefinition_invalidates() {
    let mut rt = Runtime::new();
    let class = rt.new_class(rt.core().object);
    let name = rt.intern("version");
    rt.define_method(class, name, Rc::new(|_, _| ObjRef::from_fixnum(1)));

    let obj = rt.new_object(class);
    assert_eq!(rt.invoke(obj, name), Some(ObjRef::from_fixnum(1)));
    assert_eq!(rt.cache.len(), 1);

    rt.define_method(class, name, Rc::new(|_, _| ObjRef::from_fixnum(2)));
    assert_eq!(rt.cache.len(), 0);
    assert_eq!(rt.invoke(obj, name), Some(ObjRef::from_fixnum(2)));
}

#[test]
fn invoke_passes_the_receiver() {
    let mut rt = Runtime::new();
    let class = rt.new_class(rt.core().object);
    let name = rt.intern("text");
    rt.define_method(
        class,
        name,
        Rc::new(|rt: &mut Runtime, _| rt.new_string("called")),
    );

    let obj = rt.new_object(class);
    let result = rt.invoke(obj, name).unwrap();
    assert_eq!(rt.string_text(result), "called");
}

/// Spy cache recording invalidations, for exercising the dispatcher
/// against an injected service.
#[derive(Default)]
struct SpyCache {
    inner: GlobalMethodCache,
    invalidated: Rc<RefCell<Vec<ObjRef>>>,
}

impl MethodCache for SpyCache {
    fn lookup(&self, class: ObjRef, name: SymbolId) -> Option<CachedMethod> {
        self.inner.lookup(class, name)
    }
    fn insert(&mut self, class: ObjRef, name: SymbolId, entry: CachedMethod) {
        self.inner.insert(class, name, entry);
    }
    fn invalidate_class(&mut self, class: ObjRef) {
        self.invalidated.borrow_mut().push(class);
        self.inner.invalidate_class(class);
    }
    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[test]
fn class_teardown_notifies_the_injected_cache() {
    let invalidated = Rc::new(RefCell::new(Vec::new()));
    let spy = SpyCache {
        inner: GlobalMethodCache::new(),
        invalidated: invalidated.clone(),
    };
    let mut rt = Runtime::with_method_cache(Box::new(spy));

    let class = rt.new_class(rt.core().object);
    rt.force_free(class).unwrap();
    assert_eq!(invalidated.borrow().as_slice(), &[class]);
}

#[test]
fn freeing_an_ancestor_severs_resolution_without_stale_cache_hits() {
    let mut rt = Runtime::new();
    let ancestor = rt.new_class(rt.core().object);
    let subclass = rt.new_class(ancestor);
    let name = rt.intern("inherited");
    rt.define_method(ancestor, name, Rc::new(|_, _| ObjRef::from_fixnum(42)));

    let obj = rt.new_object(subclass);
    // Warm the cache through the ancestor
    assert_eq!(rt.invoke(obj, name), Some(ObjRef::from_fixnum(42)));

    rt.force_free(ancestor).unwrap();

    // The entry cached through the freed ancestor must be gone; a fresh
    // walk stops at the recycled slot instead of reading freed storage.
    assert!(!rt.responds_to(obj, name));
    assert_eq!(rt.invoke(obj, name), None);
}

#[test]
fn invalidation_is_scoped_to_key_and_origin_classes() {
    let mut rt = Runtime::new();
    let root = rt.new_class(rt.core().object);
    let middle = rt.new_class(root);
    let leaf = rt.new_class(middle);
    let name = rt.intern("inherited");
    rt.define_method(root, name, Rc::new(|_, _| ObjRef::from_fixnum(1)));

    let via_leaf = rt.new_object(leaf);
    let via_middle = rt.new_object(middle);
    assert_eq!(rt.invoke(via_leaf, name), Some(ObjRef::from_fixnum(1)));
    assert_eq!(rt.invoke(via_middle, name), Some(ObjRef::from_fixnum(1)));
    assert_eq!(rt.cache.len(), 2);

    rt.force_free(middle).unwrap();

    // The entry keyed by the freed class is gone; the leaf-keyed entry that
    // resolved on the root is retained. Invalidation matches lookup class
    // and origin class only, not every class the walk passed through.
    assert!(rt.cache.lookup(middle, name).is_none());
    assert!(rt.cache.lookup(leaf, name).is_some());
}

#[test]
#[should_panic(expected = "utf-8")]
fn string_text_with_corrupt_bytes_is_fatal() {
    let mut rt = Runtime::new();
    let string_class = rt.core().string;
    let buf = rt.heap.buffers.alloc(BufferData::Bytes(vec![0xff, 0xfe]));
    let s = rt.heap.alloc(Record::new(
        string_class,
        Repr::ByteString(StringPayload { buf, len: 2 }),
    ));

    rt.string_text(s);
}

#[test]
fn deferred_queue_runs_each_finalizer_exactly_once() {
    let mut rt = Runtime::new();
    let a = rt.new_stream();
    let b = rt.new_stream();

    rt.force_free(a).unwrap();
    rt.force_free(b).unwrap();
    assert_eq!(rt.pending_finalizers(), 2);

    assert_eq!(rt.run_deferred_finalizers(), 2);
    assert_eq!(rt.pending_finalizers(), 0);
    // Second pass finds nothing; nothing is finalized twice
    assert_eq!(rt.run_deferred_finalizers(), 0);
}

#[test]
fn hashes_compute_entry_hashes_eagerly() {
    let mut rt = Runtime::new();
    let key = rt.new_string("k");
    let h = rt.new_hash(vec![(key, ObjRef::from_fixnum(9))]);

    match &rt.heap.record(h).repr {
        Repr::Hash(p) => {
            let table = p.table.expect("non-empty hash has a backing table");
            match rt.heap.buffers.get(table) {
                BufferData::Entries(entries) => {
                    assert_eq!(entries.len(), 1);
                    assert_eq!(entries[0].value, ObjRef::from_fixnum(9));
                }
                _ => panic!("hash table holds entries"),
            }
        }
        _ => panic!("expected hash"),
    }
}
