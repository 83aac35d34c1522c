//! Known-heap-contents tracking.
//!
//! Caches what the trace has already read from or written to the heap, so
//! repeated reads fold to the known value. Every entry is conservative
//! about aliasing: two different boxes may name the same object, so a
//! write to (obj, descr) kills every other object's entry for the same
//! descriptor, and an opaque call kills everything the embedder has not
//! declared call-invariant.

use super::OptValue;
use crate::gc::GcConfig;
use molten_core::ShapeId;
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct HeapCache {
    fields: FxHashMap<(OptValue, ShapeId, u16), OptValue>,
    items: FxHashMap<(OptValue, OptValue), OptValue>,
}

impl HeapCache {
    pub fn get_field(&self, obj: OptValue, shape: ShapeId, field: u16) -> Option<OptValue> {
        self.fields.get(&(obj, shape, field)).copied()
    }

    /// Remember the value an emitted read produced.
    pub fn record_field(&mut self, obj: OptValue, shape: ShapeId, field: u16, value: OptValue) {
        self.fields.insert((obj, shape, field), value);
    }

    /// An emitted write: other objects' entries for the same descriptor may
    /// alias and die; this object's entry becomes the written value.
    pub fn write_field(&mut self, obj: OptValue, shape: ShapeId, field: u16, value: OptValue) {
        self.fields
            .retain(|&(o, s, f), _| o == obj || (s, f) != (shape, field));
        self.fields.insert((obj, shape, field), value);
    }

    pub fn get_item(&self, arr: OptValue, index: OptValue) -> Option<OptValue> {
        self.items.get(&(arr, index)).copied()
    }

    pub fn record_item(&mut self, arr: OptValue, index: OptValue, value: OptValue) {
        self.items.insert((arr, index), value);
    }

    /// An emitted array write kills every other cached element.
    pub fn write_item(&mut self, arr: OptValue, index: OptValue, value: OptValue) {
        self.items.clear();
        self.items.insert((arr, index), value);
    }

    /// An opaque residual call: only fields the embedder promised no callee
    /// writes survive.
    pub fn across_call(&mut self, gc: &GcConfig) {
        self.fields
            .retain(|&(_, shape, field), _| gc.is_virtualizable_field(shape, field));
        self.items.clear();
    }
}
