//! Error taxonomy.
//!
//! Two families, keyed by who can observe them:
//!
//! - `VmError`: exceptions raised by the interpreted program itself
//!   (division by zero, out-of-bounds indexing, null dereference, ...).
//!   These must propagate identically whether a program runs interpreted or
//!   compiled; nothing in the JIT is allowed to swallow or invent one.
//! - `CodeError`: malformed jitcode detected while building or validating a
//!   program. These are embedder bugs and never occur at run time.

use crate::value::ValueKind;
use thiserror::Error;

/// An exception raised by the interpreted program.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("ZeroDivisionError: integer division or modulo by zero")]
    DivisionByZero,

    #[error("IndexError: array index out of range")]
    IndexOutOfRange,

    #[error("NullReferenceError: field access on null")]
    NullReference,

    #[error("TypeError: expected {expected} value, found {found}")]
    KindMismatch {
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("TypeError: object has no field {field}")]
    NoSuchField { field: u16 },
}

/// A structural problem in a jitcode program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("function {func}: register r{reg} out of range (num_regs = {num_regs})")]
    BadRegister { func: u32, reg: u16, num_regs: u16 },

    #[error("function {func}: constant index {index} out of range")]
    BadConstant { func: u32, index: u16 },

    #[error("function {func}: branch target {target} out of range")]
    BadTarget { func: u32, target: u32 },

    #[error("function {func}: unknown callee {callee}")]
    BadCallee { func: u32, callee: u32 },

    #[error("function {func}: unknown shape {shape}")]
    BadShape { func: u32, shape: u32 },

    #[error("function {func}: unknown loop site {site}")]
    BadSite { func: u32, site: u32 },

    #[error("function {func}: code does not end in a return")]
    MissingReturn { func: u32 },

    #[error("builder: unbound label {label}")]
    UnboundLabel { label: u32 },
}
