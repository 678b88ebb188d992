//! Environment frames: name → (value, const flag) tables with a retained
//! parent chain.
//!
//! Frames live in the heap like every other value, so closures can retain
//! their defining frame past the call that created it, and the cycle
//! breaker can traverse frames uniformly. Lookup walks the chain;
//! definition inserts in the current frame; assignment searches the chain
//! and implicitly defines in the current frame when the name is unbound.

use ahash::AHashMap;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::StringId,
    value::Value,
};

/// One slot of a frame.
#[derive(Debug)]
pub(crate) struct Binding {
    pub value: Value,
    pub is_const: bool,
}

/// A single environment frame.
///
/// Names are interned ids, so lookup hashes a `u32`, never text.
#[derive(Debug, Default)]
pub(crate) struct EnvFrame {
    /// Retained parent; released when this frame is destroyed.
    pub parent: Option<HeapId>,
    names: AHashMap<StringId, Binding>,
}

impl EnvFrame {
    /// Consumes the frame, pushing the parent and every bound ref id.
    pub fn take_child_ids(self, out: &mut Vec<HeapId>) {
        if let Some(parent) = self.parent {
            out.push(parent);
        }
        for (_, binding) in self.names {
            if let Some(id) = binding.value.into_ref_id() {
                out.push(id);
            }
        }
    }

    /// Pushes the parent and every bound ref id without consuming.
    pub fn child_ids(&self, out: &mut Vec<HeapId>) {
        if let Some(parent) = self.parent {
            out.push(parent);
        }
        for binding in self.names.values() {
            if let Some(id) = binding.value.ref_id() {
                out.push(id);
            }
        }
    }
}

/// Allocates a child frame, retaining the parent.
pub(crate) fn env_new(heap: &mut Heap, parent: Option<HeapId>) -> HeapId {
    if let Some(parent) = parent {
        heap.inc_ref(parent);
    }
    heap.allocate(HeapData::Env(EnvFrame {
        parent,
        names: AHashMap::new(),
    }))
}

fn frame(heap: &Heap, env: HeapId) -> &EnvFrame {
    match heap.get(env) {
        HeapData::Env(frame) => frame,
        other => panic!("expected Env frame, found {}", other.variant_name()),
    }
}

fn frame_mut(heap: &mut Heap, env: HeapId) -> &mut EnvFrame {
    match heap.get_mut(env) {
        HeapData::Env(frame) => frame,
        other => panic!("expected Env frame, found {}", other.variant_name()),
    }
}

/// Defines `name` in the current frame, taking ownership of the (already
/// retained) value. A same-frame redefinition replaces and releases the old
/// binding.
pub(crate) fn env_define(
    heap: &mut Heap,
    env: HeapId,
    name: StringId,
    value: Value,
    is_const: bool,
) {
    let old = frame_mut(heap, env)
        .names
        .insert(name, Binding { value, is_const });
    if let Some(old) = old {
        old.value.drop_with_heap(heap);
    }
}

/// Looks `name` up along the parent chain, returning a retained copy.
pub(crate) fn env_get(heap: &Heap, env: HeapId, name: StringId) -> Option<Value> {
    let mut current = Some(env);
    while let Some(id) = current {
        let f = frame(heap, id);
        if let Some(binding) = f.names.get(&name) {
            return Some(binding.value.clone_with_heap(heap));
        }
        current = f.parent;
    }
    None
}

/// Outcome of an assignment attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnvSetOutcome {
    /// Stored into an existing (or implicitly created) binding.
    Stored,
    /// The binding is const; the value was released, nothing stored.
    RejectedConst,
}

/// Assigns to the innermost frame owning `name`, or implicitly defines in
/// the current frame. Takes ownership of the value either way.
pub(crate) fn env_set(heap: &mut Heap, env: HeapId, name: StringId, value: Value) -> EnvSetOutcome {
    enum Find {
        Found(HeapId),
        Const,
        NotFound,
    }
    let found = {
        let mut current = Some(env);
        let mut result = Find::NotFound;
        while let Some(id) = current {
            let f = frame(heap, id);
            if let Some(binding) = f.names.get(&name) {
                result = if binding.is_const {
                    Find::Const
                } else {
                    Find::Found(id)
                };
                break;
            }
            current = f.parent;
        }
        result
    };
    match found {
        Find::Found(id) => {
            let old = {
                let f = frame_mut(heap, id);
                let binding = f.names.get_mut(&name).expect("binding found above");
                std::mem::replace(&mut binding.value, value)
            };
            old.drop_with_heap(heap);
            EnvSetOutcome::Stored
        }
        Find::Const => {
            value.drop_with_heap(heap);
            EnvSetOutcome::RejectedConst
        }
        Find::NotFound => {
            env_define(heap, env, name, value, false);
            EnvSetOutcome::Stored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HmlStr;

    fn name(n: u32, interner: &mut crate::intern::Interner) -> StringId {
        interner.intern(&format!("n{n}"))
    }

    #[test]
    fn define_get_and_chain_lookup() {
        let mut interner = crate::intern::Interner::new();
        let x = name(0, &mut interner);
        let mut heap = Heap::new();
        let root = env_new(&mut heap, None);
        let child = env_new(&mut heap, Some(root));

        env_define(&mut heap, root, x, Value::I64(7), false);
        assert_eq!(env_get(&heap, child, x), Some(Value::I64(7)));

        // Shadow in the child frame.
        env_define(&mut heap, child, x, Value::I64(9), false);
        assert_eq!(env_get(&heap, child, x), Some(Value::I64(9)));
        assert_eq!(env_get(&heap, root, x), Some(Value::I64(7)));

        heap.dec_ref(child);
        heap.dec_ref(root);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn assignment_targets_owning_frame() {
        let mut interner = crate::intern::Interner::new();
        let x = name(0, &mut interner);
        let mut heap = Heap::new();
        let root = env_new(&mut heap, None);
        let child = env_new(&mut heap, Some(root));

        env_define(&mut heap, root, x, Value::I64(1), false);
        assert_eq!(
            env_set(&mut heap, child, x, Value::I64(2)),
            EnvSetOutcome::Stored
        );
        assert_eq!(env_get(&heap, root, x), Some(Value::I64(2)));

        heap.dec_ref(child);
        heap.dec_ref(root);
    }

    #[test]
    fn const_rejects_reassignment_and_releases_value() {
        let mut interner = crate::intern::Interner::new();
        let x = name(0, &mut interner);
        let mut heap = Heap::new();
        let root = env_new(&mut heap, None);

        env_define(&mut heap, root, x, Value::I64(1), true);
        let s = heap.allocate(HeapData::Str(HmlStr::new("rejected")));
        assert_eq!(
            env_set(&mut heap, root, x, Value::Ref(s)),
            EnvSetOutcome::RejectedConst
        );
        // The rejected value was released, not leaked.
        assert_eq!(heap.stats().objects_by_type.get("Str"), None);

        heap.dec_ref(root);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn unbound_assignment_defines_in_current_frame() {
        let mut interner = crate::intern::Interner::new();
        let x = name(0, &mut interner);
        let mut heap = Heap::new();
        let root = env_new(&mut heap, None);
        let child = env_new(&mut heap, Some(root));

        env_set(&mut heap, child, x, Value::I64(5));
        assert_eq!(env_get(&heap, child, x), Some(Value::I64(5)));
        assert_eq!(env_get(&heap, root, x), None);

        heap.dec_ref(child);
        heap.dec_ref(root);
    }

    #[test]
    fn popping_child_releases_parent_retain() {
        let mut heap = Heap::new();
        let root = env_new(&mut heap, None);
        assert_eq!(heap.refcount(root), 1);
        let child = env_new(&mut heap, Some(root));
        assert_eq!(heap.refcount(root), 2);
        heap.dec_ref(child);
        assert_eq!(heap.refcount(root), 1);
        heap.dec_ref(root);
    }
}
