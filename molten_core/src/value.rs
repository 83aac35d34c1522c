//! Runtime values.
//!
//! A `Value` is one of three kinds: a 64-bit integer (wrapping arithmetic),
//! a double, or a reference into the heap. The JIT specializes loops per
//! *green* value tuple, so values must be usable as hash-map keys; floats
//! therefore compare and hash by bit pattern here. Numeric comparison
//! semantics live in the instruction evaluators, not in `PartialEq`.

use std::fmt;

// =============================================================================
// Value Kind
// =============================================================================

/// The kind of a runtime value. Boxes, label arguments and shape fields are
/// all typed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Float,
    Ref,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Int => write!(f, "int"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::Ref => write!(f, "ref"),
        }
    }
}

// =============================================================================
// Object Reference
// =============================================================================

/// A handle to a heap object. `ObjRef::NULL` is the distinguished null
/// reference; every other value indexes the owning `Heap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    /// The null reference.
    pub const NULL: ObjRef = ObjRef(u32::MAX);

    /// Create a reference from a raw heap index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        ObjRef(index)
    }

    /// Raw heap index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Check for null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "obj@{}", self.0)
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// A runtime value.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Int(i64),
    Float(f64),
    Ref(ObjRef),
}

impl Value {
    /// The null reference value.
    pub const NULL: Value = Value::Ref(ObjRef::NULL);

    /// The kind of this value.
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Ref(_) => ValueKind::Ref,
        }
    }

    /// The zero/default value of a kind. Freshly allocated fields and
    /// registers start out as this.
    #[inline]
    pub fn zero_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Ref => Value::NULL,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Branch truth: nonzero int, nonzero float, non-null reference.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Ref(r) => !r.is_null(),
        }
    }
}

// Bit-pattern equality so green tuples can key hash maps deterministically.
// NaN equals NaN under this relation; -0.0 and 0.0 differ.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Value::Float(v) => {
                1u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::Ref(r) => {
                2u8.hash(state);
                r.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Ref(r) => write!(f, "{}", r),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
