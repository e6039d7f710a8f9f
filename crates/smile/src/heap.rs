//! GC-heap stand-in.
//!
//! design note §1 treats the garbage collector as an external dependency: "a
//! conservative tracing collector providing `alloc`, `alloc_atomic`,
//! `realloc`". This module is the in-repo stand-in for that collaborator —
//! grounded on `ouros`'s `Heap<ResourceTracker>` slot-arena design
//! (`heap.rs`) but drastically simplified: `ouros` needs manual
//! refcounting because Python semantics require deterministic `__del__`
//! timing even under a tracing collector; Smile's design makes no such
//! promise, so this heap never frees a live object's slot itself — it grows
//! a free list only via `Heap::free`, called explicitly by the evaluator
//! when a value's owner (a `Closure`) goes out of scope and nothing else can
//! reach it. A real Smile runtime would swap this arena for bindings to an
//! actual conservative collector without changing any caller-visible API
//! other than the `HeapId`/`Heap` types themselves.

use crate::resource::ResourceTracker;
use crate::value::{HeapObject, Value};

/// Stable handle to a heap-allocated object. Never reused while a `Value`
/// referencing it is reachable from a live closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Slot-arena heap: a growable `Vec` of object slots plus a free list of
/// indices vacated by `free`. Parameterized by a `ResourceTracker` so
/// allocation can be metered by the host (design note §5).
#[derive(Debug)]
pub struct Heap<T: ResourceTracker> {
    slots: Vec<Option<HeapObject>>,
    free_list: Vec<u32>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    #[must_use]
    pub fn new(tracker: T) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            tracker,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates `object` on the heap, reusing a freed slot if one is
    /// available. Fails if the host's `ResourceTracker` rejects the
    /// allocation (e.g. an allocation-count or memory ceiling).
    pub fn alloc(&mut self, object: HeapObject) -> Result<HeapId, crate::resource::ResourceError> {
        self.tracker.on_allocate(|| object.approx_size())?;
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(object);
            Ok(HeapId(index))
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap overflow");
            self.slots.push(Some(object));
            Ok(HeapId(index))
        }
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapObject {
        self.slots[id.raw() as usize]
            .as_ref()
            .expect("dereferenced a freed HeapId")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapObject {
        self.slots[id.raw() as usize]
            .as_mut()
            .expect("dereferenced a freed HeapId")
    }

    /// Marks `id`'s slot free for reuse. Callers must guarantee no reachable
    /// `Value` still references it; the arena performs no tracing itself.
    pub fn free(&mut self, id: HeapId) {
        if let Some(object) = self.slots[id.raw() as usize].take() {
            self.tracker.on_free(|| object.approx_size());
            self.free_list.push(id.raw());
        }
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let live_objects = self.slots.iter().filter(|s| s.is_some()).count();
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.slots.len(),
        }
    }
}

/// Walks a `List`'s `d`-chain to `NullObject`, collecting each `a` in order.
/// Per design note §3 "List well-formedness": a list is well-formed iff
/// following `d` pointers reaches `NullObject` without entering a cycle,
/// checked here with Floyd's tortoise-and-hare in O(n) rather than a visited
/// set, per design note's own description of the invariant. Returns `None` if
/// `value` isn't a list at all, or if it is but isn't well-formed (contains
/// a cycle, or its final `d` isn't `NullObject`).
impl<T: ResourceTracker> Heap<T> {
    #[must_use]
    pub fn collect_well_formed_list(&self, value: Value) -> Option<Vec<Value>> {
        let mut elements = Vec::new();
        let mut slow = value;
        let mut fast = value;
        loop {
            if slow.is_null() {
                return Some(elements);
            }
            let Value::Ref(slow_id) = slow else { return None };
            let HeapObject::List { a, d, .. } = self.get(slow_id) else { return None };
            elements.push(*a);
            slow = *d;

            // Advance `fast` two steps for every one step of `slow`. If no
            // cycle exists, `fast` always stays strictly ahead of `slow`
            // until it reaches `NullObject`; if the two ever land on the
            // same heap cell, a cycle exists.
            for _ in 0..2 {
                if fast.is_null() {
                    break;
                }
                let Value::Ref(fast_id) = fast else { return None };
                let HeapObject::List { d, .. } = self.get(fast_id) else { return None };
                fast = *d;
            }
            if let (Value::Ref(s), Value::Ref(f)) = (slow, fast)
                && s == f
            {
                return None;
            }
        }
    }
}

/// Snapshot of heap occupancy, analogous to `ouros`'s `HeapStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NO_LIMIT_TRACKER;

    #[test]
    fn alloc_then_free_reuses_slot() {
        let mut heap = Heap::new(NO_LIMIT_TRACKER);
        let a = heap.alloc(HeapObject::Str("hello".to_owned())).unwrap();
        heap.free(a);
        let b = heap.alloc(HeapObject::Str("world".to_owned())).unwrap();
        assert_eq!(a, b, "freed slot should be reused");
        assert_eq!(heap.stats().live_objects, 1);
    }

    #[test]
    fn get_reads_back_allocated_object() {
        let mut heap = Heap::new(NO_LIMIT_TRACKER);
        let id = heap.alloc(HeapObject::Str("hi".to_owned())).unwrap();
        match heap.get(id) {
            HeapObject::Str(s) => assert_eq!(s, "hi"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collects_elements_of_a_well_formed_list() {
        let mut heap = Heap::new(NO_LIMIT_TRACKER);
        let tail = heap.alloc(HeapObject::List { a: Value::Int32(3), d: Value::Null, pos: None }).unwrap();
        let mid = heap.alloc(HeapObject::List { a: Value::Int32(2), d: Value::Ref(tail), pos: None }).unwrap();
        let head = heap.alloc(HeapObject::List { a: Value::Int32(1), d: Value::Ref(mid), pos: None }).unwrap();

        let elements = heap.collect_well_formed_list(Value::Ref(head)).expect("well-formed list");
        assert_eq!(elements, vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
    }

    #[test]
    fn empty_list_is_null() {
        let heap = Heap::new(NO_LIMIT_TRACKER);
        assert_eq!(heap.collect_well_formed_list(Value::Null), Some(Vec::new()));
    }

    #[test]
    fn rejects_a_cyclic_list() {
        let mut heap = Heap::new(NO_LIMIT_TRACKER);
        // Build a->b->a cycle: allocate both cells, then patch `a`'s `d` to
        // point back at `b` once `b` exists.
        let a = heap.alloc(HeapObject::List { a: Value::Int32(1), d: Value::Null, pos: None }).unwrap();
        let b = heap.alloc(HeapObject::List { a: Value::Int32(2), d: Value::Ref(a), pos: None }).unwrap();
        if let HeapObject::List { d, .. } = heap.get_mut(a) {
            *d = Value::Ref(b);
        }
        assert_eq!(heap.collect_well_formed_list(Value::Ref(a)), None, "a->b->a is a cycle, not a well-formed list");
    }

    #[test]
    fn rejects_an_improper_list() {
        let mut heap = Heap::new(NO_LIMIT_TRACKER);
        let id = heap.alloc(HeapObject::List { a: Value::Int32(1), d: Value::Int32(2), pos: None }).unwrap();
        assert_eq!(heap.collect_well_formed_list(Value::Ref(id)), None, "a `d` that isn't Null or a List is not well-formed");
    }
}
