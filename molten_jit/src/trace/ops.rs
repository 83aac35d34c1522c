//! Trace operations.
//!
//! A `ResOp` is a flat tagged record: opcode, argument boxes, optional
//! result box, and an `OpExtra` payload for descriptors (field, shape,
//! callee, snapshot, jump target). Opcode properties are bitflags; the
//! tracer, the optimizer and the backend all dispatch by `match`.
//!
//! `eval_pure` is the single evaluator for the pure subset. The jitcode
//! interpreter, the tracer's constant folding, the optimizer's folding and
//! the reference backend all call it, so "observably equivalent" holds by
//! construction for pure operations.

use super::boxes::BoxId;
use crate::cache::TokenId;
use crate::jitcode::{BinOp, FuncId, UnOp};
use crate::resume::SnapshotId;
use molten_core::{ShapeId, Value, ValueKind, VmError};
use smallvec::SmallVec;

// =============================================================================
// Opcode
// =============================================================================

/// Operation codes appearing in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Pure integer ops. Arithmetic wraps. Comparisons yield Int(0)/Int(1).
    IntAdd,
    IntSub,
    IntMul,
    /// Truncating division. Only emitted behind a nonzero-divisor guard, so
    /// pure within its trace.
    IntDiv,
    IntMod,
    IntNeg,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    /// Unsigned less-than; the bounds-check comparison.
    IntBelow,

    // Pure float ops.
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatNeg,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    IntToFloat,

    // Heap ops.
    NewStruct,
    NewArray,
    GetField,
    SetField,
    GetItem,
    SetItem,
    /// Arrays are fixed-length, so this is pure.
    ArrayLen,

    // Calls.
    Call,
    CallElidable,
    CallPure,

    // Guards. Each carries resume data in the op's `snapshot` field.
    GuardTrue,
    GuardFalse,
    /// Argument equals the constant second argument.
    GuardValue,
    /// Argument's shape equals the `OpExtra::Shape` payload.
    GuardClass,
    GuardNonNull,

    // Control.
    Label,
    Jump,
}

bitflags::bitflags! {
    /// Static properties of an opcode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// Idempotent, side-effect free, result determined by arguments.
        const PURE = 0b0000_0001;
        /// Asserts a speculative condition; carries resume data.
        const GUARD = 0b0000_0010;
        /// Writes heap state visible to the interpreter.
        const SIDE_EFFECTS = 0b0000_0100;
        /// Residual call of some flavor.
        const CALL = 0b0000_1000;
        /// Produces a fresh heap object.
        const ALLOC = 0b0001_0000;
    }
}

impl Opcode {
    pub fn flags(self) -> OpFlags {
        use Opcode::*;
        match self {
            IntAdd | IntSub | IntMul | IntDiv | IntMod | IntNeg | IntLt | IntLe | IntEq
            | IntNe | IntGt | IntGe | IntBelow | FloatAdd | FloatSub | FloatMul | FloatDiv
            | FloatNeg | FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe
            | IntToFloat | ArrayLen => OpFlags::PURE,
            NewStruct | NewArray => OpFlags::ALLOC,
            GetField | GetItem => OpFlags::empty(),
            SetField | SetItem => OpFlags::SIDE_EFFECTS,
            Call => OpFlags::CALL.union(OpFlags::SIDE_EFFECTS),
            CallElidable => OpFlags::CALL,
            CallPure => OpFlags::CALL.union(OpFlags::PURE),
            GuardTrue | GuardFalse | GuardValue | GuardClass | GuardNonNull => OpFlags::GUARD,
            Label | Jump => OpFlags::empty(),
        }
    }

    #[inline]
    pub fn is_pure(self) -> bool {
        self.flags().contains(OpFlags::PURE)
    }

    #[inline]
    pub fn is_guard(self) -> bool {
        self.flags().contains(OpFlags::GUARD)
    }

    #[inline]
    pub fn is_call(self) -> bool {
        self.flags().contains(OpFlags::CALL)
    }

    #[inline]
    pub fn has_side_effects(self) -> bool {
        self.flags().contains(OpFlags::SIDE_EFFECTS)
    }

    #[inline]
    pub fn is_alloc(self) -> bool {
        self.flags().contains(OpFlags::ALLOC)
    }

    /// Result kind of pure value-producing opcodes.
    pub fn result_kind(self) -> Option<ValueKind> {
        use Opcode::*;
        match self {
            IntAdd | IntSub | IntMul | IntDiv | IntMod | IntNeg | IntLt | IntLe | IntEq
            | IntNe | IntGt | IntGe | IntBelow | FloatLt | FloatLe | FloatEq | FloatNe
            | FloatGt | FloatGe | ArrayLen => Some(ValueKind::Int),
            FloatAdd | FloatSub | FloatMul | FloatDiv | FloatNeg | IntToFloat => {
                Some(ValueKind::Float)
            }
            NewStruct | NewArray => Some(ValueKind::Ref),
            _ => None,
        }
    }
}

impl From<BinOp> for Opcode {
    fn from(op: BinOp) -> Opcode {
        match op {
            BinOp::IntAdd => Opcode::IntAdd,
            BinOp::IntSub => Opcode::IntSub,
            BinOp::IntMul => Opcode::IntMul,
            BinOp::IntDiv => Opcode::IntDiv,
            BinOp::IntMod => Opcode::IntMod,
            BinOp::IntLt => Opcode::IntLt,
            BinOp::IntLe => Opcode::IntLe,
            BinOp::IntEq => Opcode::IntEq,
            BinOp::IntNe => Opcode::IntNe,
            BinOp::IntGt => Opcode::IntGt,
            BinOp::IntGe => Opcode::IntGe,
            BinOp::FloatAdd => Opcode::FloatAdd,
            BinOp::FloatSub => Opcode::FloatSub,
            BinOp::FloatMul => Opcode::FloatMul,
            BinOp::FloatDiv => Opcode::FloatDiv,
            BinOp::FloatLt => Opcode::FloatLt,
            BinOp::FloatLe => Opcode::FloatLe,
            BinOp::FloatEq => Opcode::FloatEq,
            BinOp::FloatNe => Opcode::FloatNe,
            BinOp::FloatGt => Opcode::FloatGt,
            BinOp::FloatGe => Opcode::FloatGe,
        }
    }
}

impl From<UnOp> for Opcode {
    fn from(op: UnOp) -> Opcode {
        match op {
            UnOp::IntNeg => Opcode::IntNeg,
            UnOp::FloatNeg => Opcode::FloatNeg,
            UnOp::IntToFloat => Opcode::IntToFloat,
        }
    }
}

// =============================================================================
// Pure Evaluation
// =============================================================================

fn int2(args: &[Value]) -> Result<(i64, i64), VmError> {
    match (args[0], args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok((a, b)),
        (a, b) => Err(VmError::KindMismatch {
            expected: ValueKind::Int,
            found: if a.kind() == ValueKind::Int { b.kind() } else { a.kind() },
        }),
    }
}

fn float2(args: &[Value]) -> Result<(f64, f64), VmError> {
    match (args[0], args[1]) {
        (Value::Float(a), Value::Float(b)) => Ok((a, b)),
        (a, b) => Err(VmError::KindMismatch {
            expected: ValueKind::Float,
            found: if a.kind() == ValueKind::Float { b.kind() } else { a.kind() },
        }),
    }
}

#[inline]
fn from_bool(b: bool) -> Value {
    Value::Int(b as i64)
}

/// Evaluate a pure, heap-independent opcode on concrete values.
///
/// `IntDiv`/`IntMod` report `DivisionByZero` so callers can decide whether
/// the raise is a real exception (interpreter) or a fold that must not
/// happen (optimizer).
pub fn eval_pure(opcode: Opcode, args: &[Value]) -> Result<Value, VmError> {
    use Opcode::*;
    Ok(match opcode {
        IntAdd => {
            let (a, b) = int2(args)?;
            Value::Int(a.wrapping_add(b))
        }
        IntSub => {
            let (a, b) = int2(args)?;
            Value::Int(a.wrapping_sub(b))
        }
        IntMul => {
            let (a, b) = int2(args)?;
            Value::Int(a.wrapping_mul(b))
        }
        IntDiv => {
            let (a, b) = int2(args)?;
            if b == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(a.wrapping_div(b))
        }
        IntMod => {
            let (a, b) = int2(args)?;
            if b == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(a.wrapping_rem(b))
        }
        IntNeg => match args[0] {
            Value::Int(a) => Value::Int(a.wrapping_neg()),
            v => {
                return Err(VmError::KindMismatch {
                    expected: ValueKind::Int,
                    found: v.kind(),
                })
            }
        },
        IntLt => {
            let (a, b) = int2(args)?;
            from_bool(a < b)
        }
        IntLe => {
            let (a, b) = int2(args)?;
            from_bool(a <= b)
        }
        IntEq => {
            let (a, b) = int2(args)?;
            from_bool(a == b)
        }
        IntNe => {
            let (a, b) = int2(args)?;
            from_bool(a != b)
        }
        IntGt => {
            let (a, b) = int2(args)?;
            from_bool(a > b)
        }
        IntGe => {
            let (a, b) = int2(args)?;
            from_bool(a >= b)
        }
        IntBelow => {
            let (a, b) = int2(args)?;
            from_bool((a as u64) < (b as u64))
        }
        FloatAdd => {
            let (a, b) = float2(args)?;
            Value::Float(a + b)
        }
        FloatSub => {
            let (a, b) = float2(args)?;
            Value::Float(a - b)
        }
        FloatMul => {
            let (a, b) = float2(args)?;
            Value::Float(a * b)
        }
        FloatDiv => {
            let (a, b) = float2(args)?;
            Value::Float(a / b)
        }
        FloatNeg => match args[0] {
            Value::Float(a) => Value::Float(-a),
            v => {
                return Err(VmError::KindMismatch {
                    expected: ValueKind::Float,
                    found: v.kind(),
                })
            }
        },
        FloatLt => {
            let (a, b) = float2(args)?;
            from_bool(a < b)
        }
        FloatLe => {
            let (a, b) = float2(args)?;
            from_bool(a <= b)
        }
        FloatEq => {
            let (a, b) = float2(args)?;
            from_bool(a == b)
        }
        FloatNe => {
            let (a, b) = float2(args)?;
            from_bool(a != b)
        }
        FloatGt => {
            let (a, b) = float2(args)?;
            from_bool(a > b)
        }
        FloatGe => {
            let (a, b) = float2(args)?;
            from_bool(a >= b)
        }
        IntToFloat => match args[0] {
            Value::Int(a) => Value::Float(a as f64),
            v => {
                return Err(VmError::KindMismatch {
                    expected: ValueKind::Int,
                    found: v.kind(),
                })
            }
        },
        other => panic!("eval_pure called on non-pure opcode {other:?}"),
    })
}

// =============================================================================
// ResOp
// =============================================================================

/// Where a trace-ending `Jump` transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// The trace's own label (closed loop).
    SelfLabel,
    /// The label of another compiled loop (bridge rejoining its parent).
    Token(TokenId),
}

/// Descriptor payload of an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpExtra {
    None,
    /// Allocation shape (`NewStruct`) or expected shape (`GuardClass`).
    Shape(ShapeId),
    /// Field descriptor for `GetField`/`SetField`.
    Field { shape: ShapeId, field: u16 },
    /// Element kind for `NewArray`.
    ArrayKind(ValueKind),
    /// Callee of a residual call.
    Func(FuncId),
    /// Target of the trace-ending jump.
    Target(JumpTarget),
}

/// One recorded operation. Guards carry their resume data in `snapshot`,
/// orthogonal to `extra` (a `GuardClass` uses both).
#[derive(Debug, Clone, PartialEq)]
pub struct ResOp {
    pub opcode: Opcode,
    pub args: SmallVec<[BoxId; 2]>,
    pub result: Option<BoxId>,
    pub extra: OpExtra,
    pub snapshot: Option<SnapshotId>,
}

impl ResOp {
    pub fn new(opcode: Opcode, args: impl Into<SmallVec<[BoxId; 2]>>) -> Self {
        ResOp {
            opcode,
            args: args.into(),
            result: None,
            extra: OpExtra::None,
            snapshot: None,
        }
    }

    pub fn with_result(mut self, result: BoxId) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_extra(mut self, extra: OpExtra) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotId) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
