//! The jitcode interpreter.
//!
//! `exec_instr` is the single concrete executor for one instruction; the
//! plain runner, the blackhole runner and the engine-driven runner are thin
//! loops around it, so all three agree on semantics by construction. The
//! tracer records operations while *re-implementing* only control flow; its
//! value semantics go through the same `eval_pure` and heap calls.
//!
//! Three drivers:
//! - `run_plain`: no engine. Baseline, residual calls, pure-call folding.
//! - `run_blackhole`: no engine either, but stops at the next loop header;
//!   this is the cold path after a guard failure.
//! - `run`: full engine. Consults the warm-up controller at every
//!   `LoopHeader` and counts calls for the inlining threshold.

use crate::engine::{Engine, HeaderOutcome};
use crate::jitcode::{FuncId, Instr, Program, Reg, SiteId};
use crate::trace::ops;
use molten_core::{Heap, ObjRef, Value, ValueKind, VmError};

// =============================================================================
// Frames
// =============================================================================

/// One live interpreter frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub func: FuncId,
    pub pc: u32,
    pub regs: Vec<Value>,
    /// Caller register receiving this frame's return value; `None` for the
    /// bottom frame of a run.
    pub ret_dst: Option<Reg>,
}

impl FrameState {
    /// A fresh frame for `func` with arguments loaded and the remaining
    /// registers zeroed.
    pub fn enter(program: &Program, func: FuncId, args: &[Value]) -> FrameState {
        let f = program.function(func);
        let mut regs = vec![Value::Int(0); f.num_regs as usize];
        regs[..args.len()].copy_from_slice(args);
        FrameState {
            func,
            pc: 0,
            regs,
            ret_dst: None,
        }
    }

    #[inline]
    pub fn get(&self, r: Reg) -> Value {
        self.regs[r.0 as usize]
    }

    #[inline]
    pub fn set(&mut self, r: Reg, v: Value) {
        self.regs[r.0 as usize] = v;
    }
}

// =============================================================================
// Single-instruction execution
// =============================================================================

/// Outcome of executing one instruction. `Continue` means the frame's pc
/// has already been advanced (fall-through or branch); the others hand a
/// control event to the driver.
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Push a frame for `func`; the caller's pc is already past the call.
    Call {
        func: FuncId,
        dst: Reg,
        args: Vec<Value>,
    },
    Return(Value),
    /// The pc still points at the `LoopHeader`; the driver decides whether
    /// to involve the engine before moving past it.
    Header(SiteId),
}

#[inline]
pub(crate) fn want_ref(v: Value) -> Result<ObjRef, VmError> {
    v.as_ref().ok_or(VmError::KindMismatch {
        expected: ValueKind::Ref,
        found: v.kind(),
    })
}

#[inline]
pub(crate) fn want_int(v: Value) -> Result<i64, VmError> {
    v.as_int().ok_or(VmError::KindMismatch {
        expected: ValueKind::Int,
        found: v.kind(),
    })
}

/// Execute the instruction at `frame.pc`.
pub fn exec_instr(
    program: &Program,
    heap: &mut Heap,
    frame: &mut FrameState,
) -> Result<Step, VmError> {
    let f = program.function(frame.func);
    let instr = f.code[frame.pc as usize];
    match instr {
        Instr::LoadConst { dst, index } => {
            frame.set(dst, f.consts[index as usize]);
        }
        Instr::Move { dst, src } => {
            let v = frame.get(src);
            frame.set(dst, v);
        }
        Instr::Binary { op, dst, lhs, rhs } => {
            let v = ops::eval_pure(op.into(), &[frame.get(lhs), frame.get(rhs)])?;
            frame.set(dst, v);
        }
        Instr::Unary { op, dst, src } => {
            let v = ops::eval_pure(op.into(), &[frame.get(src)])?;
            frame.set(dst, v);
        }
        Instr::Jump { target } => {
            frame.pc = target;
            return Ok(Step::Continue);
        }
        Instr::JumpIfTrue { cond, target } => {
            frame.pc = if frame.get(cond).is_truthy() {
                target
            } else {
                frame.pc + 1
            };
            return Ok(Step::Continue);
        }
        Instr::JumpIfFalse { cond, target } => {
            frame.pc = if frame.get(cond).is_truthy() {
                frame.pc + 1
            } else {
                target
            };
            return Ok(Step::Continue);
        }
        Instr::LoopHeader { site } => {
            return Ok(Step::Header(site));
        }
        Instr::New { dst, shape } => {
            let r = heap.allocate_struct(shape, program.shape(shape));
            frame.set(dst, Value::Ref(r));
        }
        Instr::GetField { dst, obj, field } => {
            let r = want_ref(frame.get(obj))?;
            let v = heap.get_field(r, field)?;
            frame.set(dst, v);
        }
        Instr::SetField { obj, field, src } => {
            let r = want_ref(frame.get(obj))?;
            heap.set_field(r, field, frame.get(src))?;
        }
        Instr::NewArray { dst, kind, len } => {
            let n = want_int(frame.get(len))?;
            if n < 0 {
                return Err(VmError::IndexOutOfRange);
            }
            let r = heap.allocate_array(kind, n as usize);
            frame.set(dst, Value::Ref(r));
        }
        Instr::GetItem { dst, arr, index } => {
            let r = want_ref(frame.get(arr))?;
            let i = want_int(frame.get(index))?;
            let v = heap.get_item(r, i)?;
            frame.set(dst, v);
        }
        Instr::SetItem { arr, index, src } => {
            let r = want_ref(frame.get(arr))?;
            let i = want_int(frame.get(index))?;
            heap.set_item(r, i, frame.get(src))?;
        }
        Instr::ArrayLen { dst, arr } => {
            let r = want_ref(frame.get(arr))?;
            frame.set(dst, Value::Int(heap.array_len(r)?));
        }
        Instr::Call {
            dst,
            func,
            base,
            nargs,
        } => {
            let lo = base.0 as usize;
            let args = frame.regs[lo..lo + nargs as usize].to_vec();
            frame.pc += 1;
            return Ok(Step::Call { func, dst, args });
        }
        Instr::Return { src } => {
            return Ok(Step::Return(frame.get(src)));
        }
    }
    frame.pc += 1;
    Ok(Step::Continue)
}

// =============================================================================
// Drivers
// =============================================================================

/// Pop a returning frame and deliver its value, or finish the run.
fn deliver_return(frames: &mut Vec<FrameState>, value: Value) -> Option<Value> {
    let done = frames.pop()?;
    match frames.last_mut() {
        Some(caller) => {
            if let Some(dst) = done.ret_dst {
                caller.set(dst, value);
            }
            None
        }
        None => Some(value),
    }
}

/// Run `func` to completion with no JIT involvement. Loop headers are
/// stepped over.
pub fn run_plain(
    program: &Program,
    heap: &mut Heap,
    func: FuncId,
    args: &[Value],
) -> Result<Value, VmError> {
    let mut frames = vec![FrameState::enter(program, func, args)];
    loop {
        let frame = match frames.last_mut() {
            Some(f) => f,
            None => unreachable!("frame stack never empties without a return"),
        };
        match exec_instr(program, heap, frame)? {
            Step::Continue => {}
            Step::Header(_) => frame.pc += 1,
            Step::Call { func, dst, args } => {
                let mut callee = FrameState::enter(program, func, &args);
                callee.ret_dst = Some(dst);
                frames.push(callee);
            }
            Step::Return(v) => {
                if let Some(result) = deliver_return(&mut frames, v) {
                    return Ok(result);
                }
            }
        }
    }
}

/// Where a blackhole run stopped.
#[derive(Debug, PartialEq)]
pub enum BlackholeExit {
    /// Stopped with the pc at a `LoopHeader`; the engine-driven loop takes
    /// over from there.
    AtHeader,
    /// The bottom frame returned; the whole run is over.
    Finished(Value),
}

/// Interpret with zero engine involvement until the next loop header. This
/// is the cold-path executor after deoptimization: it burns through the few
/// operations between a failed guard and the next place where warm-up
/// bookkeeping makes sense again.
pub fn run_blackhole(
    program: &Program,
    heap: &mut Heap,
    frames: &mut Vec<FrameState>,
) -> Result<BlackholeExit, VmError> {
    loop {
        let frame = match frames.last_mut() {
            Some(f) => f,
            None => unreachable!("blackhole always starts with at least one frame"),
        };
        match exec_instr(program, heap, frame)? {
            Step::Continue => {}
            Step::Header(_) => return Ok(BlackholeExit::AtHeader),
            Step::Call { func, dst, args } => {
                let mut callee = FrameState::enter(program, func, &args);
                callee.ret_dst = Some(dst);
                frames.push(callee);
            }
            Step::Return(v) => {
                if let Some(result) = deliver_return(frames, v) {
                    return Ok(BlackholeExit::Finished(result));
                }
            }
        }
    }
}

/// Run `func` under the engine: every loop header is reported to the
/// warm-up controller, which may take over execution with compiled code,
/// and every call is counted toward the inlining threshold.
pub fn run(
    program: &Program,
    heap: &mut Heap,
    engine: &mut Engine,
    func: FuncId,
    args: &[Value],
) -> Result<Value, VmError> {
    let mut frames = vec![FrameState::enter(program, func, args)];
    loop {
        let frame = match frames.last_mut() {
            Some(f) => f,
            None => unreachable!("frame stack never empties without a return"),
        };
        match exec_instr(program, heap, frame)? {
            Step::Continue => {}
            Step::Header(site) => {
                match engine.loop_header(program, heap, &mut frames, site)? {
                    HeaderOutcome::Continue => {
                        if let Some(f) = frames.last_mut() {
                            f.pc += 1;
                        }
                    }
                    // Frames were replaced; the next dispatch continues
                    // from whatever pc the engine left behind.
                    HeaderOutcome::TookOver => {}
                    HeaderOutcome::Finished(v) => return Ok(v),
                }
            }
            Step::Call { func, dst, args } => {
                engine.record_function_call(func);
                let mut callee = FrameState::enter(program, func, &args);
                callee.ret_dst = Some(dst);
                frames.push(callee);
            }
            Step::Return(v) => {
                if let Some(result) = deliver_return(&mut frames, v) {
                    return Ok(result);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitcode::{BinOp, FunctionBuilder, Instr};
    use molten_core::{Shape, Value};

    // sum(n): s = 0; while n > 0 { s += n; n -= 1 }; return s
    fn sum_program() -> (Program, FuncId) {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("sum", 1, 5);
        let n = Reg(0);
        let s = Reg(1);
        let zero = Reg(2);
        let one = Reg(3);
        let cond = Reg(4);
        b.load_const(s, Value::Int(0));
        b.load_const(zero, Value::Int(0));
        b.load_const(one, Value::Int(1));
        let top = b.new_label();
        let out = b.new_label();
        b.bind(top);
        b.binary(BinOp::IntGt, cond, n, zero);
        b.jump_if_false(cond, out);
        b.binary(BinOp::IntAdd, s, s, n);
        b.binary(BinOp::IntSub, n, n, one);
        b.jump(top);
        b.bind(out);
        b.ret(s);
        let func = program.add_function(b.finish().unwrap());
        program.validate().unwrap();
        (program, func)
    }

    #[test]
    fn straight_line_arithmetic() {
        let (program, func) = sum_program();
        let mut heap = Heap::new();
        let v = run_plain(&program, &mut heap, func, &[Value::Int(10)]).unwrap();
        assert_eq!(v, Value::Int(55));
    }

    #[test]
    fn division_by_zero_raises() {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("div", 2, 3);
        b.binary(BinOp::IntDiv, Reg(2), Reg(0), Reg(1));
        b.ret(Reg(2));
        let func = program.add_function(b.finish().unwrap());
        let mut heap = Heap::new();
        assert_eq!(
            run_plain(&program, &mut heap, func, &[Value::Int(1), Value::Int(0)]),
            Err(VmError::DivisionByZero)
        );
    }

    #[test]
    fn calls_pass_arguments_and_return() {
        let mut program = Program::new();
        let mut inner = FunctionBuilder::new("double", 1, 2);
        inner.binary(BinOp::IntAdd, Reg(1), Reg(0), Reg(0));
        inner.ret(Reg(1));
        let double = program.add_function(inner.finish().unwrap());

        let mut outer = FunctionBuilder::new("main", 1, 2);
        outer.emit(Instr::Move {
            dst: Reg(1),
            src: Reg(0),
        });
        outer.call(Reg(0), double, Reg(1), 1);
        outer.ret(Reg(0));
        let main = program.add_function(outer.finish().unwrap());
        program.validate().unwrap();

        let mut heap = Heap::new();
        let v = run_plain(&program, &mut heap, main, &[Value::Int(21)]).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn heap_instructions_roundtrip() {
        let mut program = Program::new();
        let shape = program.add_shape(Shape::new(
            "pair",
            vec![
                ("x".into(), ValueKind::Int),
                ("y".into(), ValueKind::Int),
            ],
        ));
        let mut b = FunctionBuilder::new("mk", 1, 3);
        b.emit(Instr::New { dst: Reg(1), shape });
        b.emit(Instr::SetField {
            obj: Reg(1),
            field: 0,
            src: Reg(0),
        });
        b.emit(Instr::GetField {
            dst: Reg(2),
            obj: Reg(1),
            field: 0,
        });
        b.ret(Reg(2));
        let func = program.add_function(b.finish().unwrap());
        program.validate().unwrap();

        let mut heap = Heap::new();
        let v = run_plain(&program, &mut heap, func, &[Value::Int(9)]).unwrap();
        assert_eq!(v, Value::Int(9));
        assert_eq!(heap.len(), 1);
    }
}
