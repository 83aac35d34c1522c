//! The reference backend.
//!
//! Installs a trace as a flat register-machine program: label arguments and
//! op results become numbered slots, constant boxes become inline operands.
//! `execute` is a direct loop over that program, calling the same
//! `eval_pure` and `Heap` entry points the interpreter uses, which is what
//! makes this backend the semantic yardstick a machine-code backend would
//! be measured against.
//!
//! Guard patches live behind per-guard locks inside the shared artifact, so
//! attaching a bridge never invalidates running code.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{Backend, CompileError, Outcome};
use crate::arena::SecondaryMap;
use crate::cache::TokenId;
use crate::interp::{self, want_int, want_ref};
use crate::jitcode::{FuncId, Program};
use crate::resume::collect_live_boxes;
use crate::trace::boxes::{BoxDef, BoxId};
use crate::trace::ops::{eval_pure, JumpTarget, OpExtra, Opcode, ResOp};
use crate::trace::Trace;
use molten_core::{Heap, ShapeId, Value, ValueKind, VmError};

// =============================================================================
// Compiled form
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Slot(u32),
    Const(Value),
}

/// `OpExtra` with boxes resolved away.
#[derive(Debug, Clone, Copy)]
enum ExecExtra {
    None,
    Shape(ShapeId),
    Field { field: u16 },
    ArrayKind(ValueKind),
    Func(FuncId),
    TargetSelf,
    TargetToken(TokenId),
}

#[derive(Debug)]
struct ExecOp {
    opcode: Opcode,
    operands: SmallVec<[Operand; 2]>,
    result: Option<u32>,
    extra: ExecExtra,
    /// Index into the artifact's guard table, for guard opcodes.
    guard: Option<u32>,
}

/// Where a failing guard sends control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardPatch {
    /// Fail out to the engine.
    Unpatched,
    /// Enter the bridge with the live values as entry arguments.
    Bridge(TokenId),
    /// Deliberately left failing to the engine forever.
    Generic,
}

#[derive(Debug)]
struct GuardSite {
    /// Live values in resume-data order; doubles as the bridge's entry
    /// argument list.
    live: Vec<Operand>,
    patch: RwLock<GuardPatch>,
}

#[derive(Debug)]
struct CompiledLoop {
    entry_kinds: Vec<ValueKind>,
    nslots: u32,
    code: Vec<ExecOp>,
    guards: Vec<GuardSite>,
}

// =============================================================================
// Backend
// =============================================================================

/// Trace-evaluating backend. Loops and bridges share one artifact table.
#[derive(Default)]
pub struct EvalBackend {
    artifacts: RwLock<FxHashMap<TokenId, Arc<CompiledLoop>>>,
}

impl EvalBackend {
    pub fn new() -> Self {
        EvalBackend::default()
    }

    fn artifact(&self, token: TokenId) -> Option<Arc<CompiledLoop>> {
        self.artifacts.read().get(&token).cloned()
    }

    fn install(&self, trace: &Trace, token: TokenId) -> Result<(), CompileError> {
        trace.validate()?;

        let mut map: SecondaryMap<BoxDef, Option<Operand>> =
            SecondaryMap::with_capacity(trace.boxes.len());
        let mut entry_kinds = Vec::new();
        let mut nslots: u32 = 0;
        let mut code = Vec::new();
        let mut guards: Vec<GuardSite> = Vec::new();

        for op in &trace.ops {
            if op.opcode == Opcode::Label {
                for &b in &trace.label_args {
                    map.set(b, Some(Operand::Slot(nslots)));
                    entry_kinds.push(trace.kind_of(b));
                    nslots += 1;
                }
                continue;
            }
            let operands = op
                .args
                .iter()
                .map(|&b| resolve_box(trace, &map, b))
                .collect();
            let result = op.result.map(|r| {
                let slot = nslots;
                nslots += 1;
                map.set(r, Some(Operand::Slot(slot)));
                slot
            });
            let guard = if op.opcode.is_guard() {
                let sid = op.snapshot.expect("validated trace pairs guards with snapshots");
                let live = collect_live_boxes(&trace.snapshots[sid], &trace.virtuals)
                    .into_iter()
                    .map(|b| resolve_box(trace, &map, b))
                    .collect();
                let index = guards.len() as u32;
                guards.push(GuardSite {
                    live,
                    patch: RwLock::new(GuardPatch::Unpatched),
                });
                Some(index)
            } else {
                None
            };
            code.push(ExecOp {
                opcode: op.opcode,
                operands,
                result,
                extra: translate_extra(op),
                guard,
            });
        }

        self.artifacts.write().insert(
            token,
            Arc::new(CompiledLoop {
                entry_kinds,
                nslots,
                code,
                guards,
            }),
        );
        Ok(())
    }
}

fn resolve_box(trace: &Trace, map: &SecondaryMap<BoxDef, Option<Operand>>, b: BoxId) -> Operand {
    match map.get(b).copied().flatten() {
        Some(operand) => operand,
        None => Operand::Const(
            trace
                .const_value(b)
                .expect("unproduced box in a validated trace is a constant"),
        ),
    }
}

fn translate_extra(op: &ResOp) -> ExecExtra {
    match op.extra {
        OpExtra::None => ExecExtra::None,
        OpExtra::Shape(s) => ExecExtra::Shape(s),
        OpExtra::Field { field, .. } => ExecExtra::Field { field },
        OpExtra::ArrayKind(k) => ExecExtra::ArrayKind(k),
        OpExtra::Func(f) => ExecExtra::Func(f),
        OpExtra::Target(JumpTarget::SelfLabel) => ExecExtra::TargetSelf,
        OpExtra::Target(JumpTarget::Token(t)) => ExecExtra::TargetToken(t),
    }
}

impl Backend for EvalBackend {
    fn compile_loop(&self, trace: &Trace, token: TokenId) -> Result<(), CompileError> {
        self.install(trace, token)
    }

    fn compile_bridge(&self, trace: &Trace, token: TokenId) -> Result<(), CompileError> {
        self.install(trace, token)
    }

    fn patch_guard(&self, token: TokenId, guard: u32, bridge: TokenId) {
        if let Some(artifact) = self.artifact(token) {
            let mut patch = artifact.guards[guard as usize].patch.write();
            if *patch != GuardPatch::Generic {
                *patch = GuardPatch::Bridge(bridge);
            }
        }
    }

    fn mark_guard_generic(&self, token: TokenId, guard: u32) {
        if let Some(artifact) = self.artifact(token) {
            *artifact.guards[guard as usize].patch.write() = GuardPatch::Generic;
        }
    }

    fn entry_kinds(&self, token: TokenId) -> Option<Vec<ValueKind>> {
        self.artifact(token).map(|a| a.entry_kinds.clone())
    }

    fn execute(
        &self,
        token: TokenId,
        args: &[Value],
        program: &Program,
        heap: &mut Heap,
    ) -> Outcome {
        let mut token = token;
        let mut artifact = self
            .artifact(token)
            .expect("execute is only called on installed tokens");
        let mut entry: Vec<Value> = args.to_vec();

        'enter: loop {
            let mut slots = vec![Value::Int(0); artifact.nslots as usize];
            slots[..entry.len()].copy_from_slice(&entry);

            let mut ip = 0usize;
            loop {
                let op = &artifact.code[ip];

                if op.opcode.is_guard() {
                    if !guard_holds(op, &slots, heap) {
                        let index = op.guard.expect("guard op has a guard index");
                        let site = &artifact.guards[index as usize];
                        let live_values: Vec<Value> =
                            site.live.iter().map(|&o| read(&slots, o)).collect();
                        // Copy the state out so the lock (and the borrow of
                        // `artifact` through `site`) is released before a
                        // bridge swaps the artifact.
                        let patch = *site.patch.read();
                        match patch {
                            GuardPatch::Bridge(bridge) => {
                                token = bridge;
                                artifact = self
                                    .artifact(bridge)
                                    .expect("patched bridges outlive their parents");
                                entry = live_values;
                                continue 'enter;
                            }
                            GuardPatch::Unpatched | GuardPatch::Generic => {
                                return Outcome::GuardFailed {
                                    token,
                                    guard: index,
                                    live_values,
                                };
                            }
                        }
                    }
                    ip += 1;
                    continue;
                }

                if op.opcode == Opcode::Jump {
                    let values: Vec<Value> =
                        op.operands.iter().map(|&o| read(&slots, o)).collect();
                    match op.extra {
                        ExecExtra::TargetSelf => {
                            entry = values;
                            continue 'enter;
                        }
                        ExecExtra::TargetToken(target) => {
                            token = target;
                            artifact = self
                                .artifact(target)
                                .expect("cross-trace jump targets outlive their bridges");
                            entry = values;
                            continue 'enter;
                        }
                        _ => unreachable!("jump carries a target"),
                    }
                }

                match eval_op(op, &mut slots, program, heap) {
                    Ok(()) => ip += 1,
                    Err(e) => return Outcome::Raised(e),
                }
            }
        }
    }

    fn free(&self, token: TokenId) {
        let mut artifacts = self.artifacts.write();
        artifacts.remove(&token);
        // Detach any guard still pointing at the freed artifact.
        for artifact in artifacts.values() {
            for site in &artifact.guards {
                let mut patch = site.patch.write();
                if *patch == GuardPatch::Bridge(token) {
                    *patch = GuardPatch::Unpatched;
                }
            }
        }
    }
}

// =============================================================================
// Op evaluation
// =============================================================================

#[inline]
fn read(slots: &[Value], operand: Operand) -> Value {
    match operand {
        Operand::Slot(s) => slots[s as usize],
        Operand::Const(v) => v,
    }
}

fn guard_holds(op: &ExecOp, slots: &[Value], heap: &Heap) -> bool {
    let v = read(slots, op.operands[0]);
    match op.opcode {
        Opcode::GuardTrue => v.is_truthy(),
        Opcode::GuardFalse => !v.is_truthy(),
        Opcode::GuardValue => v == read(slots, op.operands[1]),
        Opcode::GuardClass => {
            let expected = match op.extra {
                ExecExtra::Shape(s) => s,
                _ => unreachable!("GuardClass carries a shape"),
            };
            // A null or non-reference value fails the class check rather
            // than raising; the interpreter re-raises after resume.
            match v.as_ref() {
                Some(r) => heap.shape_of(r) == Ok(expected),
                None => false,
            }
        }
        Opcode::GuardNonNull => matches!(v.as_ref(), Some(r) if r != molten_core::ObjRef::NULL),
        _ => unreachable!("guard_holds only sees guards"),
    }
}

fn eval_op(
    op: &ExecOp,
    slots: &mut [Value],
    program: &Program,
    heap: &mut Heap,
) -> Result<(), VmError> {
    let value = match op.opcode {
        Opcode::NewStruct => {
            let shape = match op.extra {
                ExecExtra::Shape(s) => s,
                _ => unreachable!("NewStruct carries a shape"),
            };
            Value::Ref(heap.allocate_struct(shape, program.shape(shape)))
        }
        Opcode::NewArray => {
            let kind = match op.extra {
                ExecExtra::ArrayKind(k) => k,
                _ => unreachable!("NewArray carries an element kind"),
            };
            let n = want_int(read(slots, op.operands[0]))?;
            if n < 0 {
                return Err(VmError::IndexOutOfRange);
            }
            Value::Ref(heap.allocate_array(kind, n as usize))
        }
        Opcode::GetField => {
            let field = match op.extra {
                ExecExtra::Field { field } => field,
                _ => unreachable!("GetField carries a field descriptor"),
            };
            let r = want_ref(read(slots, op.operands[0]))?;
            heap.get_field(r, field)?
        }
        Opcode::SetField => {
            let field = match op.extra {
                ExecExtra::Field { field } => field,
                _ => unreachable!("SetField carries a field descriptor"),
            };
            let r = want_ref(read(slots, op.operands[0]))?;
            heap.set_field(r, field, read(slots, op.operands[1]))?;
            return Ok(());
        }
        Opcode::GetItem => {
            let r = want_ref(read(slots, op.operands[0]))?;
            let i = want_int(read(slots, op.operands[1]))?;
            heap.get_item(r, i)?
        }
        Opcode::SetItem => {
            let r = want_ref(read(slots, op.operands[0]))?;
            let i = want_int(read(slots, op.operands[1]))?;
            heap.set_item(r, i, read(slots, op.operands[2]))?;
            return Ok(());
        }
        Opcode::ArrayLen => {
            let r = want_ref(read(slots, op.operands[0]))?;
            Value::Int(heap.array_len(r)?)
        }
        Opcode::Call | Opcode::CallElidable | Opcode::CallPure => {
            let func = match op.extra {
                ExecExtra::Func(f) => f,
                _ => unreachable!("calls carry a callee"),
            };
            let args: Vec<Value> = op.operands.iter().map(|&o| read(slots, o)).collect();
            interp::run_plain(program, heap, func, &args)?
        }
        _ => {
            let args: SmallVec<[Value; 2]> =
                op.operands.iter().map(|&o| read(slots, o)).collect();
            eval_pure(op.opcode, &args)?
        }
    };
    if let Some(slot) = op.result {
        slots[slot as usize] = value;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::{FrameSnapshot, ResumeSlot, Snapshot};
    use smallvec::smallvec;

    fn live_snapshot(trace: &mut Trace, live: Vec<BoxId>) -> crate::resume::SnapshotId {
        trace.add_snapshot(Snapshot {
            frames: smallvec![FrameSnapshot {
                func: FuncId(0),
                pc: 0,
                regs: live.into_iter().map(ResumeSlot::Live).collect(),
                ret_dst: None,
            }],
        })
    }

    // label(i); t = i - 1; c = t > 0; guard_true(c) [t]; jump(t)
    fn countdown_trace() -> Trace {
        let mut trace = Trace::new();
        let i = trace.add_label_arg(ValueKind::Int);
        trace.seal_label();
        let one = trace.new_const(Value::Int(1));
        let zero = trace.new_const(Value::Int(0));
        let t = trace.new_var(ValueKind::Int);
        trace.push(ResOp::new(Opcode::IntSub, smallvec![i, one]).with_result(t));
        let c = trace.new_var(ValueKind::Int);
        trace.push(ResOp::new(Opcode::IntGt, smallvec![t, zero]).with_result(c));
        let snap = live_snapshot(&mut trace, vec![t]);
        trace.push(ResOp::new(Opcode::GuardTrue, smallvec![c]).with_snapshot(snap));
        trace.push(
            ResOp::new(Opcode::Jump, smallvec![t])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );
        trace
    }

    #[test]
    fn loop_runs_until_guard_fails() {
        let backend = EvalBackend::new();
        let token = TokenId(0);
        backend.compile_loop(&countdown_trace(), token).unwrap();
        assert_eq!(backend.entry_kinds(token), Some(vec![ValueKind::Int]));

        let program = Program::new();
        let mut heap = Heap::new();
        let outcome = backend.execute(token, &[Value::Int(5)], &program, &mut heap);
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                token,
                guard: 0,
                live_values: vec![Value::Int(0)],
            }
        );
    }

    #[test]
    fn patched_guard_enters_bridge() {
        let backend = EvalBackend::new();
        let root = TokenId(0);
        let bridge = TokenId(1);
        backend.compile_loop(&countdown_trace(), root).unwrap();

        // Bridge entered with the countdown's final value: fails its own
        // guard immediately so the test can observe the transfer.
        // label(x); c = x == 0; guard_false(c) [x]; jump -> root(x)
        let mut trace = Trace::new();
        let x = trace.add_label_arg(ValueKind::Int);
        trace.seal_label();
        let zero = trace.new_const(Value::Int(0));
        let c = trace.new_var(ValueKind::Int);
        trace.push(ResOp::new(Opcode::IntEq, smallvec![x, zero]).with_result(c));
        let snap = live_snapshot(&mut trace, vec![x]);
        trace.push(ResOp::new(Opcode::GuardFalse, smallvec![c]).with_snapshot(snap));
        trace.push(
            ResOp::new(Opcode::Jump, smallvec![x])
                .with_extra(OpExtra::Target(JumpTarget::Token(root))),
        );
        backend.compile_bridge(&trace, bridge).unwrap();
        backend.patch_guard(root, 0, bridge);

        let program = Program::new();
        let mut heap = Heap::new();
        let outcome = backend.execute(root, &[Value::Int(3)], &program, &mut heap);
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                token: bridge,
                guard: 0,
                live_values: vec![Value::Int(0)],
            }
        );
    }

    #[test]
    fn freeing_a_bridge_detaches_its_guard() {
        let backend = EvalBackend::new();
        let root = TokenId(0);
        let bridge = TokenId(1);
        backend.compile_loop(&countdown_trace(), root).unwrap();
        backend.compile_bridge(&countdown_trace(), bridge).unwrap();
        backend.patch_guard(root, 0, bridge);
        backend.free(bridge);

        let program = Program::new();
        let mut heap = Heap::new();
        let outcome = backend.execute(root, &[Value::Int(2)], &program, &mut heap);
        // Control fails out to the engine instead of entering the freed
        // bridge.
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                token: root,
                guard: 0,
                live_values: vec![Value::Int(0)],
            }
        );
    }

    #[test]
    fn generic_guards_refuse_patches() {
        let backend = EvalBackend::new();
        let root = TokenId(0);
        let bridge = TokenId(1);
        backend.compile_loop(&countdown_trace(), root).unwrap();
        backend.compile_bridge(&countdown_trace(), bridge).unwrap();
        backend.mark_guard_generic(root, 0);
        backend.patch_guard(root, 0, bridge);

        let program = Program::new();
        let mut heap = Heap::new();
        let outcome = backend.execute(root, &[Value::Int(2)], &program, &mut heap);
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                token: root,
                guard: 0,
                live_values: vec![Value::Int(0)],
            }
        );
    }

    #[test]
    fn raising_op_reports_the_error() {
        // label(a, b); q = a / b; jump(q, b)
        let mut trace = Trace::new();
        let a = trace.add_label_arg(ValueKind::Int);
        let b = trace.add_label_arg(ValueKind::Int);
        trace.seal_label();
        let q = trace.new_var(ValueKind::Int);
        trace.push(ResOp::new(Opcode::IntDiv, smallvec![a, b]).with_result(q));
        trace.push(
            ResOp::new(Opcode::Jump, smallvec![q, b])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let backend = EvalBackend::new();
        let token = TokenId(0);
        backend.compile_loop(&trace, token).unwrap();
        let program = Program::new();
        let mut heap = Heap::new();
        let outcome = backend.execute(
            token,
            &[Value::Int(7), Value::Int(0)],
            &program,
            &mut heap,
        );
        assert_eq!(outcome, Outcome::Raised(VmError::DivisionByZero));
    }
}
