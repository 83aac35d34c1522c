//! Facts established by emitted guards.
//!
//! Once a guard on a value has been emitted, everything it asserts is true
//! for the rest of the trace; later guards subsumed by a recorded fact are
//! dropped. A class fact implies non-nullness.

use super::OptValue;
use molten_core::{ObjRef, ShapeId, Value};
use rustc_hash::FxHashMap;

#[derive(Debug, Default, Clone, Copy)]
struct Facts {
    truthy: Option<bool>,
    shape: Option<ShapeId>,
    nonnull: bool,
}

#[derive(Debug, Default)]
pub struct FactTable {
    facts: FxHashMap<OptValue, Facts>,
}

impl FactTable {
    pub fn known_truthy(&self, v: OptValue) -> Option<bool> {
        if let OptValue::Const(c) = v {
            return Some(c.is_truthy());
        }
        self.facts.get(&v).and_then(|f| f.truthy)
    }

    pub fn set_truthy(&mut self, v: OptValue, truthy: bool) {
        self.facts.entry(v).or_default().truthy = Some(truthy);
    }

    pub fn known_shape(&self, v: OptValue) -> Option<ShapeId> {
        self.facts.get(&v).and_then(|f| f.shape)
    }

    pub fn set_shape(&mut self, v: OptValue, shape: ShapeId) {
        let f = self.facts.entry(v).or_default();
        f.shape = Some(shape);
        f.nonnull = true;
    }

    pub fn is_nonnull(&self, v: OptValue) -> bool {
        match v {
            // A constant reference is whatever it is; null never gets here
            // from a successful concrete run, but check anyway.
            OptValue::Const(Value::Ref(r)) => r != ObjRef::NULL,
            OptValue::Const(_) => false,
            OptValue::Virtual(_) => true,
            OptValue::Box(_) => self.facts.get(&v).map(|f| f.nonnull).unwrap_or(false),
        }
    }

    pub fn set_nonnull(&mut self, v: OptValue) {
        self.facts.entry(v).or_default().nonnull = true;
    }
}
