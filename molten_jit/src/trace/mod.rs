//! The trace data model.
//!
//! A `Trace` owns everything recorded for one linear execution path: the box
//! arena, the operation list, and the snapshot/virtual arenas the guards
//! point into. Dropping the trace frees the whole cyclic structure at once.
//!
//! Structure invariants, checked by `validate`:
//! - ops begin with `Label(args)` and end with `Jump(target, args)`;
//! - a self-closing jump's arguments match the label's in count and kind;
//! - every variable box is produced exactly once (by an op or as a label
//!   argument), constant boxes never;
//! - every guard carries a snapshot, nothing else does.

pub mod boxes;
pub mod ops;

use crate::arena::Arena;
use crate::resume::{Snapshot, SnapshotId, VirtualSnapshot};
use boxes::{BoxDef, BoxId};
use molten_core::{Value, ValueKind};
use ops::{JumpTarget, OpExtra, Opcode, ResOp};
use thiserror::Error;

/// Violation of a trace structure invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("trace has no operations")]
    Empty,
    #[error("trace does not begin with a label")]
    NoLabel,
    #[error("trace does not end with a jump")]
    NoJump,
    #[error("jump passes {found} arguments where the label expects {expected}")]
    JumpArityMismatch { expected: usize, found: usize },
    #[error("jump argument {index} has the wrong kind for its label argument")]
    JumpKindMismatch { index: usize },
    #[error("box #{box_index} is produced more than once")]
    MultipleAssignment { box_index: u32 },
    #[error("operation {op_index} writes its result into a constant box")]
    ConstantResult { op_index: usize },
    #[error("guard at operation {op_index} has no snapshot")]
    MissingSnapshot { op_index: usize },
}

/// A recorded trace.
#[derive(Debug, Default)]
pub struct Trace {
    pub boxes: Arena<BoxDef>,
    pub snapshots: Arena<Snapshot>,
    pub virtuals: Arena<VirtualSnapshot>,
    pub ops: Vec<ResOp>,
    /// The arguments of the opening label, in order. These are the red
    /// values a caller passes when entering the compiled artifact.
    pub label_args: Vec<BoxId>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    /// Allocate a fresh variable box.
    #[inline]
    pub fn new_var(&mut self, kind: ValueKind) -> BoxId {
        self.boxes.alloc(BoxDef::var(kind))
    }

    /// Allocate a constant box.
    #[inline]
    pub fn new_const(&mut self, value: Value) -> BoxId {
        self.boxes.alloc(BoxDef::constant(value))
    }

    #[inline]
    pub fn kind_of(&self, id: BoxId) -> ValueKind {
        self.boxes[id].kind
    }

    /// The constant value of a box, if it is a constant box.
    #[inline]
    pub fn const_value(&self, id: BoxId) -> Option<Value> {
        self.boxes[id].constant
    }

    /// Create a label argument box and register it.
    pub fn add_label_arg(&mut self, kind: ValueKind) -> BoxId {
        let b = self.new_var(kind);
        self.label_args.push(b);
        b
    }

    /// Emit the opening label op from `label_args`. Called once.
    pub fn seal_label(&mut self) {
        let args = self.label_args.clone();
        self.ops.push(ResOp::new(Opcode::Label, args.as_slice()));
    }

    #[inline]
    pub fn push(&mut self, op: ResOp) {
        self.ops.push(op);
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> SnapshotId {
        self.snapshots.alloc(snapshot)
    }

    /// Operation count excluding the label and the final jump.
    pub fn body_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !matches!(op.opcode, Opcode::Label | Opcode::Jump))
            .count()
    }

    /// Number of guards in the trace.
    pub fn guard_count(&self) -> usize {
        self.ops.iter().filter(|op| op.opcode.is_guard()).count()
    }

    /// The target of the trace-ending jump, if the trace is closed.
    pub fn jump_target(&self) -> Option<JumpTarget> {
        match self.ops.last() {
            Some(op) if op.opcode == Opcode::Jump => match op.extra {
                OpExtra::Target(t) => Some(t),
                _ => None,
            },
            _ => None,
        }
    }

    /// Check all structure invariants, including the closed-loop invariant.
    pub fn validate(&self) -> Result<(), TraceError> {
        let first = self.ops.first().ok_or(TraceError::Empty)?;
        if first.opcode != Opcode::Label {
            return Err(TraceError::NoLabel);
        }
        let last = self.ops.last().ok_or(TraceError::Empty)?;
        if last.opcode != Opcode::Jump {
            return Err(TraceError::NoJump);
        }

        // Closed loop: jump args match label args in count and kind. For a
        // cross-loop jump the target token's label is checked by the backend
        // at patch time, where the other trace is in scope.
        if matches!(last.extra, OpExtra::Target(JumpTarget::SelfLabel)) {
            if last.args.len() != self.label_args.len() {
                return Err(TraceError::JumpArityMismatch {
                    expected: self.label_args.len(),
                    found: last.args.len(),
                });
            }
            for (index, (&j, &l)) in last.args.iter().zip(&self.label_args).enumerate() {
                if self.kind_of(j) != self.kind_of(l) {
                    return Err(TraceError::JumpKindMismatch { index });
                }
            }
        }

        // Single assignment and guard/snapshot pairing.
        let mut produced = vec![false; self.boxes.len()];
        for &arg in &self.label_args {
            produced[arg.as_usize()] = true;
        }
        for (op_index, op) in self.ops.iter().enumerate() {
            if op.opcode.is_guard() && op.snapshot.is_none() {
                return Err(TraceError::MissingSnapshot { op_index });
            }
            if let Some(result) = op.result {
                if self.boxes[result].is_constant() {
                    return Err(TraceError::ConstantResult { op_index });
                }
                if produced[result.as_usize()] {
                    return Err(TraceError::MultipleAssignment {
                        box_index: result.index(),
                    });
                }
                produced[result.as_usize()] = true;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
