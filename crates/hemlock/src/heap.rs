//! Reference-counted slot arena backing all heap runtime values.
//!
//! Every heap value lives in one slot, addressed by [`HeapId`]. Slots carry
//! an atomic refcount; `dec_ref` at count 1 frees the slot (pushing it onto
//! a free list for reuse) and recursively releases children. A freed slot
//! is `None`, and every accessor carries the "object already freed" check,
//! which is the double-free detection invariant: observing a freed slot
//! through a stale id panics rather than resurrecting it.

use std::{
    cell::Cell,
    collections::BTreeMap,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{ast::FunctionDef, channel::ChannelState, env::EnvFrame, value::Value};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A heap string: UTF-8 text plus a lazily computed codepoint count.
///
/// Byte length is `text.len()`; the codepoint count is cached on first use
/// since `len()` on strings reports characters, not bytes.
#[derive(Debug)]
pub(crate) struct HmlStr {
    text: Box<str>,
    char_count: Cell<Option<usize>>,
}

impl HmlStr {
    pub fn new(text: impl Into<Box<str>>) -> Self {
        Self {
            text: text.into(),
            char_count: Cell::new(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    /// Codepoint count, cached after the first call.
    pub fn char_count(&self) -> usize {
        if let Some(count) = self.char_count.get() {
            return count;
        }
        let count = self.text.chars().count();
        self.char_count.set(Some(count));
        count
    }
}

/// A dynamic or `define`-typed object. Field order is insertion order and
/// is observable through `for-in`.
#[derive(Debug, Default)]
pub(crate) struct HmlObject {
    /// Declared type name for instances of a `define` shape; `None` for
    /// plain dynamic objects.
    pub type_name: Option<String>,
    pub fields: IndexMap<String, Value>,
}

/// A callable function value: the shared definition plus the environment it
/// closed over. `env` is a retained reference; the cycle breaker nulls it
/// at teardown.
#[derive(Debug)]
pub(crate) struct FunctionValue {
    pub def: Rc<FunctionDef>,
    pub env: Option<HeapId>,
}

/// An open (or closed) file produced by the `open` builtin.
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub path: String,
    pub file: Option<std::fs::File>,
    pub writable: bool,
}

/// Payload of one heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(HmlStr),
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    Object(HmlObject),
    Function(FunctionValue),
    File(FileHandle),
    Channel(Arc<ChannelState>),
    Env(EnvFrame),
}

impl HeapData {
    /// Static variant name for stats and diagnostics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Buffer(_) => "Buffer",
            Self::Array(_) => "Array",
            Self::Object(_) => "Object",
            Self::Function(_) => "Function",
            Self::File(_) => "File",
            Self::Channel(_) => "Channel",
            Self::Env(_) => "Env",
        }
    }

    /// Consumes the payload, pushing the ids of every directly held child.
    ///
    /// Contained `Value`s are consumed without running their drop guard;
    /// the caller releases the returned ids.
    fn take_child_ids(self, out: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Buffer(_) | Self::File(_) | Self::Channel(_) => {}
            Self::Array(values) => {
                for value in values {
                    if let Some(id) = value.into_ref_id() {
                        out.push(id);
                    }
                }
            }
            Self::Object(object) => {
                for (_, value) in object.fields {
                    if let Some(id) = value.into_ref_id() {
                        out.push(id);
                    }
                }
            }
            Self::Function(function) => {
                if let Some(env) = function.env {
                    out.push(env);
                }
            }
            Self::Env(frame) => frame.take_child_ids(out),
        }
    }

    /// Pushes the ids of every directly held child without consuming.
    fn child_ids(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Buffer(_) | Self::File(_) | Self::Channel(_) => {}
            Self::Array(values) => {
                for value in values {
                    if let Some(id) = value.ref_id() {
                        out.push(id);
                    }
                }
            }
            Self::Object(object) => {
                for value in object.fields.values() {
                    if let Some(id) = value.ref_id() {
                        out.push(id);
                    }
                }
            }
            Self::Function(function) => {
                if let Some(env) = function.env {
                    out.push(env);
                }
            }
            Self::Env(frame) => frame.child_ids(out),
        }
    }
}

/// Snapshot of heap state at a point in time.
///
/// Used by tests to assert that a completed run released everything: after
/// the cycle breaker and the root release, `live_objects` must be zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Breakdown of live objects by variant name, deterministic order.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

/// One slot: refcount plus payload.
///
/// The refcount uses an atomic so `inc_ref` needs only shared access,
/// avoiding borrow conflicts during lookups that also hold heap data.
#[derive(Debug)]
struct HeapValue {
    refcount: AtomicUsize,
    data: Option<HeapData>,
}

/// Reference-counted arena that backs all heap-only runtime values.
///
/// Uses a free list to reuse slots from freed values, keeping memory usage
/// constant for long-running loops that repeatedly allocate and free.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapValue>>,
    /// Freed slot ids available for reuse. Populated by `dec_ref`,
    /// consumed by `allocate`.
    free_list: Vec<HeapId>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new heap value with refcount 1, reusing a freed slot
    /// when one is available.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let entry = HeapValue {
            refcount: AtomicUsize::new(1),
            data: Some(data),
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the reference count, freeing the value and recursively
    /// releasing its children once it hits zero.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let entry = {
            let slot = self
                .entries
                .get_mut(id.index())
                .expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::SeqCst);
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::SeqCst);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        self.free_list.push(id);

        if let Some(data) = entry.data {
            let mut child_ids = Vec::new();
            data.take_child_ids(&mut child_ids);
            for child_id in child_ids {
                self.dec_ref(child_id);
            }
        }
    }

    /// Returns an immutable reference to the heap data at the given id.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
            .as_ref()
            .expect("Heap::get: data missing")
    }

    /// Returns heap data if the slot is live, `None` otherwise.
    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref()?.data.as_ref()
    }

    /// Returns a mutable reference to the heap data at the given id.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: data missing")
    }

    /// Current refcount of a live value (tests and assertions).
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |e| e.refcount.load(Ordering::SeqCst))
    }

    /// Takes a stats snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            if let Some(data) = &entry.data {
                *objects_by_type.entry(data.variant_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_type,
        }
    }

    /// Breaks closure cycles before the root environment is released.
    ///
    /// Closure environments can form cycles with functions that capture
    /// their own defining frame; plain refcounting never collects those.
    /// This walks everything reachable from `root` with a visited set,
    /// nulls the environment pointer of every function value found, and
    /// releases those environments.
    pub fn break_cycles(&mut self, root: HeapId) {
        let mut visited: AHashSet<HeapId> = AHashSet::new();
        let mut stack = vec![root];
        let mut function_ids = Vec::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(data) = self.get_if_live(id) else {
                continue;
            };
            if matches!(data, HeapData::Function(_)) {
                function_ids.push(id);
            }
            data.child_ids(&mut stack);
        }

        // Null the back pointers first, then release: a release mid-walk
        // could free an environment the walk still needs.
        let mut released = Vec::new();
        for fn_id in function_ids {
            if let Some(HeapData::Function(function)) = self.get_mut_if_live(fn_id)
                && let Some(env) = function.env.take()
            {
                released.push(env);
            }
        }
        for env in released {
            self.dec_ref(env);
        }
    }

    fn get_mut_if_live(&mut self, id: HeapId) -> Option<&mut HeapData> {
        self.entries.get_mut(id.index())?.as_mut()?.data.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_reuses_freed_slots() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Str(HmlStr::new("a")));
        let b = heap.allocate(HeapData::Str(HmlStr::new("b")));
        heap.dec_ref(a);
        let c = heap.allocate(HeapData::Str(HmlStr::new("c")));
        assert_eq!(a, c, "freed slot should be reused");
        assert_ne!(b, c);
        let stats = heap.stats();
        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.total_slots, 2);
    }

    #[test]
    fn dec_ref_releases_children_recursively() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::Str(HmlStr::new("x")));
        let array = heap.allocate(HeapData::Array(vec![Value::Ref(inner)]));
        assert_eq!(heap.refcount(inner), 1);
        heap.dec_ref(array);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn shared_child_survives_one_parent() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::Str(HmlStr::new("x")));
        heap.inc_ref(inner);
        let a = heap.allocate(HeapData::Array(vec![Value::Ref(inner)]));
        let b = heap.allocate(HeapData::Array(vec![Value::Ref(inner)]));
        heap.dec_ref(a);
        assert_eq!(heap.refcount(inner), 1);
        assert!(matches!(heap.get(inner), HeapData::Str(_)));
        heap.dec_ref(b);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn double_free_is_detected() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str(HmlStr::new("x")));
        heap.dec_ref(id);
        heap.dec_ref(id);
    }

    #[test]
    fn char_count_is_cached() {
        let s = HmlStr::new("héllo");
        assert_eq!(s.byte_len(), 6);
        assert_eq!(s.char_count(), 5);
        assert_eq!(s.char_count(), 5);
    }
}
