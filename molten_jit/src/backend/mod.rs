//! The backend contract.
//!
//! A backend turns validated traces into executable artifacts, keyed by
//! `TokenId`. The engine never sees artifacts directly: it installs traces,
//! patches guards toward bridges, and calls `execute`, which runs until a
//! guard without an attached bridge fails or the guest raises. Following
//! bridge chains and cross-trace jumps is the backend's business; deciding
//! what to do about a failed guard is the engine's.

pub mod eval;

use crate::cache::TokenId;
use crate::trace::{Trace, TraceError};
use molten_core::{Heap, Value, ValueKind, VmError};
use thiserror::Error;

use crate::jitcode::Program;

/// Why a trace was rejected at installation time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("malformed trace: {0}")]
    Malformed(#[from] TraceError),
    #[error("unknown token {0:?}")]
    UnknownToken(TokenId),
}

/// How a run of compiled code ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An unpatched guard failed. `live_values` are the runtime values of
    /// the guard's live boxes, in resume-data order.
    GuardFailed {
        token: TokenId,
        guard: u32,
        live_values: Vec<Value>,
    },
    /// The guest raised while executing compiled code.
    Raised(VmError),
}

/// Compiles and executes traces. The engine owns exactly one.
pub trait Backend {
    /// Install a root loop trace under `token`.
    fn compile_loop(&self, trace: &Trace, token: TokenId) -> Result<(), CompileError>;

    /// Install a bridge trace under `token`. Identical to a loop except
    /// for how control enters it.
    fn compile_bridge(&self, trace: &Trace, token: TokenId) -> Result<(), CompileError>;

    /// Redirect guard `guard` of `token` to enter `bridge` on failure.
    fn patch_guard(&self, token: TokenId, guard: u32, bridge: TokenId);

    /// Mark a guard as never worth bridging again; it keeps failing to
    /// the engine.
    fn mark_guard_generic(&self, token: TokenId, guard: u32);

    /// The kinds of `token`'s entry arguments, if it is installed.
    fn entry_kinds(&self, token: TokenId) -> Option<Vec<ValueKind>>;

    /// Run `token` with `args` until an unbridged guard fails or the
    /// guest raises. Compiled loops never return normally.
    fn execute(&self, token: TokenId, args: &[Value], program: &Program, heap: &mut Heap)
        -> Outcome;

    /// Discard the artifact for `token` and detach any guards patched
    /// toward it.
    fn free(&self, token: TokenId);
}
