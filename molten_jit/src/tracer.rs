//! The tracing meta-interpreter.
//!
//! The tracer *is* the interpreter while tracing: it executes each
//! instruction concretely (so all heap effects happen exactly once) and
//! simultaneously records the operations the compiled code will need to
//! repeat them. Control flow is not recorded; instead a guard pins down the
//! direction every conditional took, with a snapshot of all live frames so
//! the instruction can be re-executed concretely if the guard ever fails.
//!
//! Values carry a concrete `Value` and a trace box at all times. Green
//! registers (and anything already constant) ride in constant boxes and
//! fold away; red registers are the label arguments of the trace.
//!
//! Raising instructions are traced as guard-plus-pure-op: a nonzero-divisor
//! guard before division, an unsigned bounds guard before indexing. If the
//! concretely executed path itself raises, there is nothing useful to
//! compile and the trace is abandoned with the exception propagating.

use crate::jitcode::{CallEffect, FuncId, Instr, Program, Reg, SiteId};
use crate::cache::TokenId;
use crate::interp::{self, FrameState};
use crate::resume::{FrameSnapshot, ResumeSlot, Snapshot, SnapshotId};
use crate::stats::AbortReason;
use crate::trace::boxes::BoxId;
use crate::trace::ops::{eval_pure, JumpTarget, OpExtra, Opcode, ResOp};
use crate::trace::Trace;
use crate::warmup::{JitParams, WarmupState};
use molten_core::{Heap, Value, ValueKind, VmError};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

/// Deepest frame stack the tracer will follow; an inline past this aborts.
const MAX_INLINE_DEPTH: usize = 10;

// =============================================================================
// Tracer state
// =============================================================================

/// A value during tracing: what it is now, and which box names it in the
/// trace.
#[derive(Debug, Clone, Copy)]
struct TracedValue {
    value: Value,
    bx: BoxId,
}

#[derive(Debug)]
struct TracerFrame {
    func: FuncId,
    pc: u32,
    regs: Vec<TracedValue>,
    ret_dst: Option<Reg>,
}

/// How a trace run ended.
#[derive(Debug)]
pub enum TraceEnd {
    /// The loop closed; the trace is ready for optimization.
    Closed(Trace),
    /// The trace was abandoned; interpretation continues from `frames`.
    Aborted(AbortReason),
    /// The function containing the loop returned while tracing.
    RootReturned(Value),
    /// The traced execution raised; the exception propagates concretely.
    Raised(VmError),
}

/// Result of one trace run: how it ended plus the concrete machine state at
/// that point (empty for `RootReturned` and `Raised`).
#[derive(Debug)]
pub struct TraceRun {
    pub end: TraceEnd,
    pub frames: Vec<FrameState>,
}

enum TraceStop {
    Closed,
    Abort(AbortReason),
    RootReturned(Value),
    Raised(VmError),
}

pub struct Tracer<'a> {
    program: &'a Program,
    params: &'a JitParams,
    warmup: &'a WarmupState,
    trace: Trace,
    frames: Vec<TracerFrame>,
    consts: FxHashMap<Value, BoxId>,
    root_site: SiteId,
    root_greens: Vec<Value>,
    close_target: JumpTarget,
    /// Kinds the closing jump's arguments must match (the entry label of
    /// this trace, or of the parent loop for a bridge).
    close_kinds: Vec<ValueKind>,
}

impl<'a> Tracer<'a> {
    /// Start tracing a root loop. `frame` is the interpreter frame whose pc
    /// sits at the `LoopHeader` of `site`.
    pub fn for_loop(
        program: &'a Program,
        params: &'a JitParams,
        warmup: &'a WarmupState,
        site: SiteId,
        greens: Vec<Value>,
        frame: &FrameState,
    ) -> Tracer<'a> {
        let mut tracer = Tracer {
            program,
            params,
            warmup,
            trace: Trace::new(),
            frames: Vec::new(),
            consts: FxHashMap::default(),
            root_site: site,
            root_greens: greens,
            close_target: JumpTarget::SelfLabel,
            close_kinds: Vec::new(),
        };

        let decl = program.site(site);
        let mut regs: Vec<Option<TracedValue>> = vec![None; frame.regs.len()];
        for &r in &decl.reds {
            let value = frame.get(r);
            let bx = tracer.trace.add_label_arg(value.kind());
            regs[r.0 as usize] = Some(TracedValue { value, bx });
            tracer.close_kinds.push(value.kind());
        }
        // Greens and undeclared registers enter as constants. Any register
        // live across the header that varies per iteration must be declared
        // red; that is the embedder's side of the loop-site contract.
        let regs = regs
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    let value = frame.regs[i];
                    TracedValue {
                        value,
                        bx: tracer.trace.new_const(value),
                    }
                })
            })
            .collect();
        tracer.trace.seal_label();
        tracer.frames.push(TracerFrame {
            func: frame.func,
            pc: frame.pc,
            regs,
            ret_dst: None,
        });
        tracer
    }

    /// Start tracing a bridge from a failed guard. The snapshot and `live`
    /// come from the guard's resume data; `live_values` are the runtime
    /// values of those boxes at the failure. The bridge closes by jumping
    /// to `target`, the root loop's token.
    #[allow(clippy::too_many_arguments)]
    pub fn for_bridge(
        program: &'a Program,
        params: &'a JitParams,
        warmup: &'a WarmupState,
        snapshot: &Snapshot,
        live: &[BoxId],
        live_values: &[Value],
        root_site: SiteId,
        root_greens: Vec<Value>,
        target: TokenId,
        target_kinds: Vec<ValueKind>,
    ) -> Tracer<'a> {
        let mut tracer = Tracer {
            program,
            params,
            warmup,
            trace: Trace::new(),
            frames: Vec::new(),
            consts: FxHashMap::default(),
            root_site,
            root_greens,
            close_target: JumpTarget::Token(target),
            close_kinds: target_kinds,
        };

        // One label argument per live box of the failed guard, in resume
        // order; this is the calling convention the parent's guard uses
        // when it transfers into the compiled bridge.
        let args: Vec<BoxId> = live_values
            .iter()
            .map(|v| tracer.trace.add_label_arg(v.kind()))
            .collect();
        tracer.trace.seal_label();

        for (depth, frame) in snapshot.frames.iter().enumerate() {
            let regs = frame
                .regs
                .iter()
                .map(|slot| match *slot {
                    ResumeSlot::Const(value) => {
                        let bx = tracer.const_box(value);
                        TracedValue { value, bx }
                    }
                    ResumeSlot::Live(b) => {
                        let i = live
                            .iter()
                            .position(|&l| l == b)
                            .expect("snapshot box appears in its live set");
                        TracedValue {
                            value: live_values[i],
                            bx: args[i],
                        }
                    }
                    ResumeSlot::Virtual(_) => {
                        unreachable!("guards with virtual resume state are never bridged")
                    }
                })
                .collect();
            tracer.frames.push(TracerFrame {
                func: frame.func,
                pc: frame.pc,
                regs,
                ret_dst: if depth == 0 { None } else { frame.ret_dst },
            });
        }
        tracer
    }

    /// Trace until the loop closes or the attempt dies.
    pub fn run(mut self, heap: &mut Heap) -> TraceRun {
        // A root trace starts on the header itself; step over it so closure
        // is detected on the *next* arrival.
        if let JumpTarget::SelfLabel = self.close_target {
            self.top_mut().pc += 1;
        }
        loop {
            if self.trace.body_len() > self.params.trace_limit {
                return self.finish(TraceStop::Abort(AbortReason::TraceTooLong));
            }
            match self.step(heap) {
                Ok(()) => {}
                Err(stop) => return self.finish(stop),
            }
        }
    }

    fn finish(mut self, stop: TraceStop) -> TraceRun {
        let frames = match stop {
            TraceStop::Closed | TraceStop::Abort(_) => self
                .frames
                .iter()
                .map(|f| FrameState {
                    func: f.func,
                    pc: f.pc,
                    regs: f.regs.iter().map(|tv| tv.value).collect(),
                    ret_dst: f.ret_dst,
                })
                .collect(),
            // The run is over; there is no machine state to resume.
            TraceStop::RootReturned(_) | TraceStop::Raised(_) => Vec::new(),
        };
        let end = match stop {
            TraceStop::Closed => TraceEnd::Closed(std::mem::take(&mut self.trace)),
            TraceStop::Abort(reason) => TraceEnd::Aborted(reason),
            TraceStop::RootReturned(v) => TraceEnd::RootReturned(v),
            TraceStop::Raised(e) => TraceEnd::Raised(e),
        };
        TraceRun { end, frames }
    }

    // -------------------------------------------------------------------------
    // Recording helpers
    // -------------------------------------------------------------------------

    #[inline]
    fn top(&self) -> &TracerFrame {
        self.frames.last().expect("tracer always has a frame")
    }

    #[inline]
    fn top_mut(&mut self) -> &mut TracerFrame {
        self.frames.last_mut().expect("tracer always has a frame")
    }

    #[inline]
    fn reg(&self, r: Reg) -> TracedValue {
        self.top().regs[r.0 as usize]
    }

    #[inline]
    fn set_reg(&mut self, r: Reg, tv: TracedValue) {
        self.top_mut().regs[r.0 as usize] = tv;
    }

    fn const_box(&mut self, v: Value) -> BoxId {
        if let Some(&b) = self.consts.get(&v) {
            return b;
        }
        let b = self.trace.new_const(v);
        self.consts.insert(v, b);
        b
    }

    fn const_tv(&mut self, v: Value) -> TracedValue {
        TracedValue {
            value: v,
            bx: self.const_box(v),
        }
    }

    fn is_const(&self, tv: TracedValue) -> bool {
        self.trace.const_value(tv.bx).is_some()
    }

    /// Snapshot all frames at the current pc, pre-instruction.
    fn take_snapshot(&mut self) -> SnapshotId {
        let mut frames: SmallVec<[FrameSnapshot; 2]> = SmallVec::new();
        for (depth, f) in self.frames.iter().enumerate() {
            let regs = f
                .regs
                .iter()
                .map(|tv| match self.trace.const_value(tv.bx) {
                    Some(v) => ResumeSlot::Const(v),
                    None => ResumeSlot::Live(tv.bx),
                })
                .collect();
            frames.push(FrameSnapshot {
                func: f.func,
                pc: f.pc,
                regs,
                ret_dst: if depth == 0 { None } else { f.ret_dst },
            });
        }
        self.trace.add_snapshot(Snapshot { frames })
    }

    /// Record a value-producing operation and return its result.
    fn emit(
        &mut self,
        opcode: Opcode,
        args: SmallVec<[BoxId; 2]>,
        extra: OpExtra,
        result: Value,
    ) -> TracedValue {
        let bx = self.trace.new_var(result.kind());
        self.trace
            .push(ResOp::new(opcode, args).with_result(bx).with_extra(extra));
        TracedValue { value: result, bx }
    }

    /// Record an effect-only operation.
    fn emit_effect(&mut self, opcode: Opcode, args: SmallVec<[BoxId; 2]>, extra: OpExtra) {
        self.trace.push(ResOp::new(opcode, args).with_extra(extra));
    }

    /// Record a guard on the current pre-instruction state.
    fn guard(&mut self, opcode: Opcode, args: SmallVec<[BoxId; 2]>) {
        let snapshot = self.take_snapshot();
        self.trace
            .push(ResOp::new(opcode, args).with_snapshot(snapshot));
    }

    // -------------------------------------------------------------------------
    // One traced instruction
    // -------------------------------------------------------------------------

    fn step(&mut self, heap: &mut Heap) -> Result<(), TraceStop> {
        let func = self.top().func;
        let pc = self.top().pc;
        let instr = self.program.function(func).code[pc as usize];

        match instr {
            Instr::LoadConst { dst, index } => {
                let v = self.program.function(func).consts[index as usize];
                let tv = self.const_tv(v);
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::Move { dst, src } => {
                let tv = self.reg(src);
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::Binary { op, dst, lhs, rhs } => {
                let a = self.reg(lhs);
                let b = self.reg(rhs);
                let opcode: Opcode = op.into();
                let tv = if self.is_const(a) && self.is_const(b) {
                    let v = eval_pure(opcode, &[a.value, b.value])
                        .map_err(TraceStop::Raised)?;
                    self.const_tv(v)
                } else {
                    if op.can_raise() {
                        // The compiled path must only divide by what this
                        // path divided by: nonzero.
                        if b.value == Value::Int(0) {
                            return Err(TraceStop::Raised(VmError::DivisionByZero));
                        }
                        if !self.is_const(b) {
                            let zero = self.const_box(Value::Int(0));
                            let cond = self.emit(
                                Opcode::IntNe,
                                smallvec![b.bx, zero],
                                OpExtra::None,
                                Value::Int(1),
                            );
                            self.guard(Opcode::GuardTrue, smallvec![cond.bx]);
                        }
                    }
                    let v = eval_pure(opcode, &[a.value, b.value])
                        .map_err(TraceStop::Raised)?;
                    self.emit(opcode, smallvec![a.bx, b.bx], OpExtra::None, v)
                };
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::Unary { op, dst, src } => {
                let a = self.reg(src);
                let opcode: Opcode = op.into();
                let v = eval_pure(opcode, &[a.value]).map_err(TraceStop::Raised)?;
                let tv = if self.is_const(a) {
                    self.const_tv(v)
                } else {
                    self.emit(opcode, smallvec![a.bx], OpExtra::None, v)
                };
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::Jump { target } => {
                self.top_mut().pc = target;
            }
            Instr::JumpIfTrue { cond, target } => {
                let c = self.reg(cond);
                let taken = c.value.is_truthy();
                if !self.is_const(c) {
                    let opcode = if taken {
                        Opcode::GuardTrue
                    } else {
                        Opcode::GuardFalse
                    };
                    self.guard(opcode, smallvec![c.bx]);
                }
                self.top_mut().pc = if taken { target } else { pc + 1 };
            }
            Instr::JumpIfFalse { cond, target } => {
                let c = self.reg(cond);
                let taken = !c.value.is_truthy();
                if !self.is_const(c) {
                    let opcode = if taken {
                        Opcode::GuardFalse
                    } else {
                        Opcode::GuardTrue
                    };
                    self.guard(opcode, smallvec![c.bx]);
                }
                self.top_mut().pc = if taken { target } else { pc + 1 };
            }
            Instr::LoopHeader { site } => {
                if self.frames.len() == 1 && site == self.root_site {
                    let greens = self.greens_of(site);
                    if greens == self.root_greens {
                        return self.close(site);
                    }
                }
                // An inner loop, or the same site on other greens: unroll
                // it into this trace and keep going.
                self.top_mut().pc += 1;
            }
            Instr::New { dst, shape } => {
                let r = heap.allocate_struct(shape, self.program.shape(shape));
                let tv = self.emit(
                    Opcode::NewStruct,
                    smallvec![],
                    OpExtra::Shape(shape),
                    Value::Ref(r),
                );
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::GetField { dst, obj, field } => {
                let o = self.reg(obj);
                let r = interp::want_ref(o.value).map_err(TraceStop::Raised)?;
                let shape = heap.shape_of(r).map_err(TraceStop::Raised)?;
                let v = heap.get_field(r, field).map_err(TraceStop::Raised)?;
                if !self.is_const(o) {
                    // Pins both non-nullness and the field layout.
                    self.guard_class(o.bx, shape);
                }
                let tv = self.emit(
                    Opcode::GetField,
                    smallvec![o.bx],
                    OpExtra::Field { shape, field },
                    v,
                );
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::SetField { obj, field, src } => {
                let o = self.reg(obj);
                let s = self.reg(src);
                let r = interp::want_ref(o.value).map_err(TraceStop::Raised)?;
                let shape = heap.shape_of(r).map_err(TraceStop::Raised)?;
                if !self.is_const(o) {
                    self.guard_class(o.bx, shape);
                }
                heap.set_field(r, field, s.value).map_err(TraceStop::Raised)?;
                self.emit_effect(
                    Opcode::SetField,
                    smallvec![o.bx, s.bx],
                    OpExtra::Field { shape, field },
                );
                self.top_mut().pc += 1;
            }
            Instr::NewArray { dst, kind, len } => {
                let l = self.reg(len);
                let n = interp::want_int(l.value).map_err(TraceStop::Raised)?;
                if n < 0 {
                    return Err(TraceStop::Raised(VmError::IndexOutOfRange));
                }
                let r = heap.allocate_array(kind, n as usize);
                let tv = self.emit(
                    Opcode::NewArray,
                    smallvec![l.bx],
                    OpExtra::ArrayKind(kind),
                    Value::Ref(r),
                );
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::GetItem { dst, arr, index } => {
                let a = self.reg(arr);
                let i = self.reg(index);
                let r = interp::want_ref(a.value).map_err(TraceStop::Raised)?;
                let idx = interp::want_int(i.value).map_err(TraceStop::Raised)?;
                let v = heap.get_item(r, idx).map_err(TraceStop::Raised)?;
                self.bounds_guard(heap, a, i)?;
                let tv = self.emit(Opcode::GetItem, smallvec![a.bx, i.bx], OpExtra::None, v);
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::SetItem { arr, index, src } => {
                let a = self.reg(arr);
                let i = self.reg(index);
                let s = self.reg(src);
                let r = interp::want_ref(a.value).map_err(TraceStop::Raised)?;
                let idx = interp::want_int(i.value).map_err(TraceStop::Raised)?;
                // Concrete write first: it is the authority on whether this
                // path raises at all.
                heap.set_item(r, idx, s.value).map_err(TraceStop::Raised)?;
                self.bounds_guard(heap, a, i)?;
                self.emit_effect(Opcode::SetItem, smallvec![a.bx, i.bx, s.bx], OpExtra::None);
                self.top_mut().pc += 1;
            }
            Instr::ArrayLen { dst, arr } => {
                let a = self.reg(arr);
                let r = interp::want_ref(a.value).map_err(TraceStop::Raised)?;
                let len = heap.array_len(r).map_err(TraceStop::Raised)?;
                // Arrays are fixed-length, so a constant array has a
                // constant length.
                let tv = if self.is_const(a) {
                    self.const_tv(Value::Int(len))
                } else {
                    self.emit(
                        Opcode::ArrayLen,
                        smallvec![a.bx],
                        OpExtra::None,
                        Value::Int(len),
                    )
                };
                self.set_reg(dst, tv);
                self.top_mut().pc += 1;
            }
            Instr::Call {
                dst,
                func: callee,
                base,
                nargs,
            } => {
                self.trace_call(heap, dst, callee, base, nargs)?;
            }
            Instr::Return { src } => {
                let v = self.reg(src);
                if self.frames.len() == 1 {
                    return Err(TraceStop::RootReturned(v.value));
                }
                let done = self.frames.pop().expect("inner frame exists");
                if let Some(dst) = done.ret_dst {
                    self.set_reg(dst, v);
                }
            }
        }
        Ok(())
    }

    /// Pin an object's class (and, implicitly, non-nullness). Dropping
    /// redundant repeats is the optimizer's job.
    fn guard_class(&mut self, obj: BoxId, shape: molten_core::ShapeId) {
        let snapshot = self.take_snapshot();
        self.trace.push(
            ResOp::new(Opcode::GuardClass, smallvec![obj])
                .with_extra(OpExtra::Shape(shape))
                .with_snapshot(snapshot),
        );
    }

    /// Record the unsigned bounds check for an in-bounds access that was
    /// just performed concretely.
    fn bounds_guard(
        &mut self,
        heap: &Heap,
        arr: TracedValue,
        index: TracedValue,
    ) -> Result<(), TraceStop> {
        if self.is_const(arr) && self.is_const(index) {
            // Fixed array, fixed index, already known in bounds.
            return Ok(());
        }
        let r = interp::want_ref(arr.value).map_err(TraceStop::Raised)?;
        let len = heap.array_len(r).map_err(TraceStop::Raised)?;
        let len_tv = if self.is_const(arr) {
            self.const_tv(Value::Int(len))
        } else {
            self.emit(
                Opcode::ArrayLen,
                smallvec![arr.bx],
                OpExtra::None,
                Value::Int(len),
            )
        };
        let cond = self.emit(
            Opcode::IntBelow,
            smallvec![index.bx, len_tv.bx],
            OpExtra::None,
            Value::Int(1),
        );
        self.guard(Opcode::GuardTrue, smallvec![cond.bx]);
        Ok(())
    }

    fn trace_call(
        &mut self,
        heap: &mut Heap,
        dst: Reg,
        callee: FuncId,
        base: Reg,
        nargs: u16,
    ) -> Result<(), TraceStop> {
        let lo = base.0 as usize;
        let args: Vec<TracedValue> =
            self.top().regs[lo..lo + nargs as usize].to_vec();
        let effect = self.program.function(callee).effect;
        let all_const = args.iter().all(|&a| self.is_const(a));

        // The caller resumes after the call whatever happens below.
        self.top_mut().pc += 1;

        let values: Vec<Value> = args.iter().map(|a| a.value).collect();
        match effect {
            CallEffect::Pure if all_const => {
                let v = interp::run_plain(self.program, heap, callee, &values)
                    .map_err(TraceStop::Raised)?;
                let tv = self.const_tv(v);
                self.set_reg(dst, tv);
            }
            CallEffect::Pure | CallEffect::Elidable => {
                let v = interp::run_plain(self.program, heap, callee, &values)
                    .map_err(TraceStop::Raised)?;
                let opcode = if effect == CallEffect::Pure {
                    Opcode::CallPure
                } else {
                    Opcode::CallElidable
                };
                let boxes: SmallVec<[BoxId; 2]> = args.iter().map(|a| a.bx).collect();
                let tv = self.emit(opcode, boxes, OpExtra::Func(callee), v);
                self.set_reg(dst, tv);
            }
            CallEffect::Opaque => {
                let inline = self.params.inlining
                    && !(self.program.policy.can_never_inline)(callee)
                    && self.warmup.function_is_hot(self.params, callee);
                if inline {
                    if self.frames.len() >= MAX_INLINE_DEPTH {
                        return Err(TraceStop::Abort(AbortReason::InlineTooDeep));
                    }
                    let f = self.program.function(callee);
                    let mut regs: Vec<TracedValue> = args;
                    let zero = self.const_tv(Value::Int(0));
                    regs.resize(f.num_regs as usize, zero);
                    self.frames.push(TracerFrame {
                        func: callee,
                        pc: 0,
                        regs,
                        ret_dst: Some(dst),
                    });
                } else {
                    let v = interp::run_plain(self.program, heap, callee, &values)
                        .map_err(TraceStop::Raised)?;
                    let boxes: SmallVec<[BoxId; 2]> = args.iter().map(|a| a.bx).collect();
                    let tv = self.emit(Opcode::Call, boxes, OpExtra::Func(callee), v);
                    self.set_reg(dst, tv);
                }
            }
        }
        Ok(())
    }

    fn greens_of(&self, site: SiteId) -> Vec<Value> {
        let decl = self.program.site(site);
        decl.greens
            .iter()
            .map(|&r| self.top().regs[r.0 as usize].value)
            .collect()
    }

    /// Close the trace back to its entry (or to the parent loop's entry for
    /// a bridge).
    fn close(&mut self, site: SiteId) -> Result<(), TraceStop> {
        let decl = self.program.site(site);
        let reds: Vec<TracedValue> = decl
            .reds
            .iter()
            .map(|&r| self.top().regs[r.0 as usize])
            .collect();
        if reds.len() != self.close_kinds.len() {
            return Err(TraceStop::Abort(AbortReason::KindMismatch));
        }
        for (tv, &kind) in reds.iter().zip(&self.close_kinds) {
            if self.trace.kind_of(tv.bx) != kind {
                return Err(TraceStop::Abort(AbortReason::KindMismatch));
            }
        }
        let boxes: SmallVec<[BoxId; 2]> = reds.iter().map(|tv| tv.bx).collect();
        let target = self.close_target;
        self.trace
            .push(ResOp::new(Opcode::Jump, boxes).with_extra(OpExtra::Target(target)));
        Err(TraceStop::Closed)
    }
}

// =============================================================================
// Tests
// =============================================================================
