//! A meta-tracing JIT engine over a register-based jitcode.
//!
//! The embedding interpreter is written once, in jitcode ([`jitcode`]); the
//! engine derives compiled loops from it by tracing hot paths at annotated
//! loop headers. The pipeline:
//!
//! 1. [`warmup`] counts loop-header arrivals per (site, green tuple) and
//!    fires the tracer past a threshold.
//! 2. [`tracer`] runs the program concretely while recording a linear
//!    [`trace`], pinning every control decision with a guard that carries
//!    [`resume`] data.
//! 3. [`opt`] folds, forwards, removes allocations and prunes guards in a
//!    single forward pass.
//! 4. A [`backend`] installs the result under a token from [`cache`] and
//!    runs it; the shipped [`backend::eval`] backend evaluates traces
//!    directly and serves as the semantic reference.
//! 5. When a guard fails, [`bridge`] rebuilds interpreter frames from the
//!    guard's snapshot; hot guards get bridge traces patched on, bounded
//!    per guard, until they go generic.
//!
//! [`engine::Engine`] ties the stages together behind two entry points the
//! interpreter calls, and [`interp::run`] is that interpreter.

pub mod arena;
pub mod backend;
pub mod bridge;
pub mod cache;
pub mod engine;
pub mod gc;
pub mod interp;
pub mod jitcode;
pub mod opt;
pub mod resume;
pub mod stats;
pub mod trace;
pub mod tracer;
pub mod warmup;

pub use backend::{Backend, CompileError, Outcome};
pub use cache::TokenId;
pub use engine::{Engine, HeaderOutcome};
pub use gc::GcConfig;
pub use jitcode::{
    BinOp, CallEffect, FuncId, FunctionBuilder, Instr, JitFunction, LoopSite, Program, Reg,
    SiteId, TracePolicy, UnOp,
};
pub use stats::JitStats;
pub use warmup::JitParams;
