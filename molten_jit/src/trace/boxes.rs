//! Dataflow boxes.
//!
//! A box is an SSA-style value produced during tracing: either a *constant*
//! box whose value was fixed at trace time, or a *variable* box whose value
//! is only known at run time. Within one trace each variable box is produced
//! by exactly one operation, or is a label argument.

use crate::arena::Id;
use molten_core::{Value, ValueKind};

/// Handle of a box in the owning trace's arena.
pub type BoxId = Id<BoxDef>;

/// Definition of one box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxDef {
    pub kind: ValueKind,
    /// `Some` for constant boxes.
    pub constant: Option<Value>,
}

impl BoxDef {
    /// A variable box of the given kind.
    #[inline]
    pub fn var(kind: ValueKind) -> Self {
        BoxDef {
            kind,
            constant: None,
        }
    }

    /// A constant box holding `value`.
    #[inline]
    pub fn constant(value: Value) -> Self {
        BoxDef {
            kind: value.kind(),
            constant: Some(value),
        }
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_box_carries_kind() {
        let b = BoxDef::constant(Value::Float(1.5));
        assert!(b.is_constant());
        assert_eq!(b.kind, ValueKind::Float);
    }

    #[test]
    fn variable_box_has_no_value() {
        let b = BoxDef::var(ValueKind::Int);
        assert!(!b.is_constant());
        assert_eq!(b.constant, None);
    }
}
