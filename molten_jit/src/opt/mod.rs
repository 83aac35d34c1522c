//! The trace optimizer.
//!
//! One forward pass that re-emits a recorded trace into a fresh one. Every
//! source box maps to what is known about it downstream: a constant, a box
//! of the output trace, or a virtual object. The passes are not phases but
//! cooperating tables consulted during the single walk:
//!
//! - constant folding and CSE of pure ops ([`pure`]);
//! - known-heap-contents forwarding with aliasing-conservative and
//!   call-aware invalidation ([`heap`]);
//! - allocation removal with forcing at escapes and at the back-edge
//!   ([`virtualize`]);
//! - guard dropping and strengthening from established facts ([`guards`]).
//!
//! Guard snapshots are rewritten through the same mapping, which is where
//! `ResumeSlot::Virtual` entries come from: a snapshot may name an object
//! that no longer exists, described field-by-field for the resume engine.

pub mod guards;
pub mod heap;
pub mod pure;
pub mod virtualize;

use crate::gc::GcConfig;
use crate::jitcode::Program;
use crate::resume::{ResumeSlot, Snapshot, SnapshotId, VirtualId, VirtualSnapshot};
use crate::trace::boxes::BoxId;
use crate::trace::ops::{eval_pure, OpExtra, Opcode, ResOp};
use crate::trace::Trace;
use guards::FactTable;
use heap::HeapCache;
use molten_core::{Heap, Value, ValueKind};
use pure::{ExtraKey, PureCache};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use virtualize::VirtualState;

use crate::interp;

/// Which tables are active. All on by default; tests and diagnosis switch
/// passes off individually.
#[derive(Debug, Clone, Copy)]
pub struct OptConfig {
    pub fold_pure: bool,
    pub cache_heap: bool,
    pub virtualize: bool,
    pub strengthen_guards: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            fold_pure: true,
            cache_heap: true,
            virtualize: true,
            strengthen_guards: true,
        }
    }
}

/// What the optimizer knows a source box to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptValue {
    Const(Value),
    /// A box of the *output* trace.
    Box(BoxId),
    /// A removed allocation, tracked in the `VirtualState`.
    Virtual(u32),
}

/// Optimize `src` into a fresh trace.
pub fn optimize(program: &Program, gc: &GcConfig, config: OptConfig, src: &Trace) -> Trace {
    let mut opt = Optimizer {
        program,
        gc,
        config,
        src,
        out: Trace::new(),
        map: FxHashMap::default(),
        rewrites: FxHashMap::default(),
        consts: FxHashMap::default(),
        producers: FxHashMap::default(),
        pure: PureCache::default(),
        heap_cache: HeapCache::default(),
        virtuals: VirtualState::default(),
        facts: FactTable::default(),
    };
    for i in 0..src.ops.len() {
        let op = src.ops[i].clone();
        opt.visit(&op);
    }
    opt.out
}

struct Optimizer<'a> {
    program: &'a Program,
    gc: &'a GcConfig,
    config: OptConfig,
    src: &'a Trace,
    out: Trace,
    /// Source box -> downstream knowledge.
    map: FxHashMap<BoxId, OptValue>,
    /// Output box -> stronger knowledge established later (by value
    /// guards). Applied on every resolution.
    rewrites: FxHashMap<BoxId, OptValue>,
    /// Constant-box dedup for the output trace.
    consts: FxHashMap<Value, BoxId>,
    /// Output box -> the pure comparison that produced it, for guard
    /// strengthening.
    producers: FxHashMap<BoxId, (Opcode, SmallVec<[OptValue; 2]>)>,
    pure: PureCache,
    heap_cache: HeapCache,
    virtuals: VirtualState,
    facts: FactTable,
}

impl<'a> Optimizer<'a> {
    // -------------------------------------------------------------------------
    // Value plumbing
    // -------------------------------------------------------------------------

    /// Apply forcing and value-guard rewrites until stable.
    fn normalize(&self, mut v: OptValue) -> OptValue {
        loop {
            match v {
                OptValue::Box(b) => match self.rewrites.get(&b) {
                    Some(&next) => v = next,
                    None => return v,
                },
                OptValue::Virtual(cell) => match self.virtuals.forced(cell) {
                    Some(b) => v = OptValue::Box(b),
                    None => return v,
                },
                c => return c,
            }
        }
    }

    fn resolve(&self, old: BoxId) -> OptValue {
        let v = match self.map.get(&old) {
            Some(&v) => v,
            None => OptValue::Const(
                self.src
                    .const_value(old)
                    .expect("unmapped source box is a constant"),
            ),
        };
        self.normalize(v)
    }

    fn bind(&mut self, op: &ResOp, v: OptValue) {
        let result = op.result.expect("value op has a result");
        self.map.insert(result, v);
    }

    fn const_box(&mut self, v: Value) -> BoxId {
        if let Some(&b) = self.consts.get(&v) {
            return b;
        }
        let b = self.out.new_const(v);
        self.consts.insert(v, b);
        b
    }

    /// Turn a value into an output box, forcing virtuals as a side effect.
    fn materialize(&mut self, v: OptValue) -> BoxId {
        match self.normalize(v) {
            OptValue::Const(c) => self.const_box(c),
            OptValue::Box(b) => b,
            OptValue::Virtual(cell) => self.force(cell),
        }
    }

    /// Emit the deferred allocation of a virtual and write back its
    /// non-zero fields. Marked forced before the writeback so cyclic
    /// structures terminate.
    fn force(&mut self, cell: u32) -> BoxId {
        if let Some(b) = self.virtuals.forced(cell) {
            return b;
        }
        let shape = self.virtuals.shape(cell);
        let b = self.out.new_var(ValueKind::Ref);
        self.out.push(
            ResOp::new(Opcode::NewStruct, smallvec![])
                .with_result(b)
                .with_extra(OpExtra::Shape(shape)),
        );
        self.virtuals.set_forced(cell, b);

        let decl = self.program.shape(shape);
        let fields: Vec<OptValue> = self.virtuals.fields(cell).to_vec();
        for (index, field) in fields.into_iter().enumerate() {
            let field = self.normalize(field);
            let kind = decl
                .field_kind(index as u16)
                .expect("virtual matches its shape");
            // A fresh allocation is already zeroed.
            if field == OptValue::Const(Value::zero_of(kind)) {
                continue;
            }
            let vb = self.materialize(field);
            self.out.push(
                ResOp::new(Opcode::SetField, smallvec![b, vb]).with_extra(OpExtra::Field {
                    shape,
                    field: index as u16,
                }),
            );
            if self.config.cache_heap {
                self.heap_cache
                    .record_field(OptValue::Box(b), shape, index as u16, field);
            }
        }
        b
    }

    fn new_result(&mut self, op: &ResOp) -> BoxId {
        let old = op.result.expect("value op has a result");
        self.out.new_var(self.src.kind_of(old))
    }

    // -------------------------------------------------------------------------
    // Snapshot rewriting
    // -------------------------------------------------------------------------

    fn remap_snapshot(&mut self, old: SnapshotId) -> SnapshotId {
        let src_snapshot = self.src.snapshots[old].clone();
        let mut memo: FxHashMap<u32, VirtualId> = FxHashMap::default();
        let frames = src_snapshot
            .frames
            .iter()
            .map(|frame| {
                let regs = frame
                    .regs
                    .iter()
                    .map(|slot| self.remap_slot(*slot, &mut memo))
                    .collect();
                crate::resume::FrameSnapshot {
                    func: frame.func,
                    pc: frame.pc,
                    regs,
                    ret_dst: frame.ret_dst,
                }
            })
            .collect();
        self.out.add_snapshot(Snapshot { frames })
    }

    fn remap_slot(
        &mut self,
        slot: ResumeSlot,
        memo: &mut FxHashMap<u32, VirtualId>,
    ) -> ResumeSlot {
        match slot {
            ResumeSlot::Const(v) => ResumeSlot::Const(v),
            ResumeSlot::Live(old) => match self.resolve(old) {
                OptValue::Const(v) => ResumeSlot::Const(v),
                OptValue::Box(b) => ResumeSlot::Live(b),
                OptValue::Virtual(cell) => {
                    ResumeSlot::Virtual(self.snapshot_virtual(cell, memo))
                }
            },
            ResumeSlot::Virtual(_) => {
                unreachable!("tracer snapshots never contain virtual slots")
            }
        }
    }

    /// Describe a still-virtual object in resume data, field values as of
    /// this guard. Cycles are tied through the memo.
    fn snapshot_virtual(
        &mut self,
        cell: u32,
        memo: &mut FxHashMap<u32, VirtualId>,
    ) -> VirtualId {
        if let Some(&id) = memo.get(&cell) {
            return id;
        }
        let shape = self.virtuals.shape(cell);
        let id = self.out.virtuals.alloc(VirtualSnapshot {
            shape,
            fields: Vec::new(),
        });
        memo.insert(cell, id);
        let fields: Vec<ResumeSlot> = self
            .virtuals
            .fields(cell)
            .to_vec()
            .into_iter()
            .map(|f| match self.normalize(f) {
                OptValue::Const(v) => ResumeSlot::Const(v),
                OptValue::Box(b) => ResumeSlot::Live(b),
                OptValue::Virtual(inner) => {
                    ResumeSlot::Virtual(self.snapshot_virtual(inner, memo))
                }
            })
            .collect();
        self.out.virtuals[id].fields = fields;
        id
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn visit(&mut self, op: &ResOp) {
        use Opcode::*;
        match op.opcode {
            Label => {
                for &old in &self.src.label_args {
                    let kind = self.src.kind_of(old);
                    let new = self.out.add_label_arg(kind);
                    self.map.insert(old, OptValue::Box(new));
                }
                self.out.seal_label();
            }
            Jump => self.jump_op(op),
            GuardTrue | GuardFalse | GuardValue | GuardClass | GuardNonNull => {
                self.guard_op(op)
            }
            NewStruct => self.new_struct(op),
            GetField => self.get_field(op),
            SetField => self.set_field(op),
            NewArray => self.new_array(op),
            GetItem => self.get_item(op),
            SetItem => self.set_item(op),
            Call | CallElidable | CallPure => self.call_op(op),
            _ => self.pure_op(op),
        }
    }

    // -------------------------------------------------------------------------
    // Pure operations
    // -------------------------------------------------------------------------

    fn resolved_args(&self, op: &ResOp) -> SmallVec<[OptValue; 2]> {
        op.args.iter().map(|&a| self.resolve(a)).collect()
    }

    fn pure_op(&mut self, op: &ResOp) {
        let args = self.resolved_args(op);
        if self.config.fold_pure {
            // ArrayLen is pure but heap-dependent; it folds at trace time
            // (fixed-length arrays) or not at all.
            if op.opcode != Opcode::ArrayLen {
                if let Some(values) = all_const(&args) {
                    if let Ok(v) = eval_pure(op.opcode, &values) {
                        self.bind(op, OptValue::Const(v));
                        return;
                    }
                }
            }
            if let Some(hit) = self.pure.lookup(op.opcode, &args, ExtraKey::None) {
                self.bind(op, hit);
                return;
            }
        }
        let boxes: SmallVec<[BoxId; 2]> =
            args.iter().map(|&a| self.materialize(a)).collect();
        let r = self.new_result(op);
        self.out
            .push(ResOp::new(op.opcode, boxes).with_result(r).with_extra(op.extra));
        if self.config.fold_pure {
            self.pure
                .insert(op.opcode, args.clone(), ExtraKey::None, OptValue::Box(r));
        }
        if self.config.strengthen_guards
            && matches!(op.opcode, Opcode::IntEq | Opcode::IntNe)
        {
            self.producers.insert(r, (op.opcode, args));
        }
        self.bind(op, OptValue::Box(r));
    }

    // -------------------------------------------------------------------------
    // Heap operations
    // -------------------------------------------------------------------------

    fn new_struct(&mut self, op: &ResOp) {
        let shape = match op.extra {
            OpExtra::Shape(s) => s,
            _ => unreachable!("NewStruct carries a shape"),
        };
        if self.config.virtualize {
            let decl = self.program.shape(shape);
            let zeroes = (0..decl.field_count())
                .map(|i| {
                    let kind = decl.field_kind(i as u16).expect("field in range");
                    OptValue::Const(Value::zero_of(kind))
                })
                .collect();
            let cell = self.virtuals.new_cell(shape, zeroes);
            self.bind(op, OptValue::Virtual(cell));
        } else {
            let r = self.new_result(op);
            self.out.push(
                ResOp::new(Opcode::NewStruct, smallvec![])
                    .with_result(r)
                    .with_extra(op.extra),
            );
            self.bind(op, OptValue::Box(r));
        }
    }

    fn get_field(&mut self, op: &ResOp) {
        let (shape, field) = match op.extra {
            OpExtra::Field { shape, field } => (shape, field),
            _ => unreachable!("GetField carries a field descriptor"),
        };
        let obj = self.resolve(op.args[0]);
        if let OptValue::Virtual(cell) = obj {
            let v = self.normalize(self.virtuals.field(cell, field));
            self.bind(op, v);
            return;
        }
        if self.config.cache_heap {
            if let Some(v) = self.heap_cache.get_field(obj, shape, field) {
                self.bind(op, self.normalize(v));
                return;
            }
        }
        let ob = self.materialize(obj);
        let r = self.new_result(op);
        self.out.push(
            ResOp::new(Opcode::GetField, smallvec![ob])
                .with_result(r)
                .with_extra(op.extra),
        );
        if self.config.cache_heap {
            self.heap_cache
                .record_field(obj, shape, field, OptValue::Box(r));
        }
        self.bind(op, OptValue::Box(r));
    }

    fn set_field(&mut self, op: &ResOp) {
        let (shape, field) = match op.extra {
            OpExtra::Field { shape, field } => (shape, field),
            _ => unreachable!("SetField carries a field descriptor"),
        };
        let obj = self.resolve(op.args[0]);
        let val = self.resolve(op.args[1]);
        if let OptValue::Virtual(cell) = obj {
            // Write into the deferred object; nothing escapes.
            self.virtuals.set_field(cell, field, val);
            return;
        }
        let ob = self.materialize(obj);
        let vb = self.materialize(val);
        self.out
            .push(ResOp::new(Opcode::SetField, smallvec![ob, vb]).with_extra(op.extra));
        if self.config.cache_heap {
            let stored = self.normalize(val);
            self.heap_cache.write_field(obj, shape, field, stored);
        }
    }

    fn new_array(&mut self, op: &ResOp) {
        let args = self.resolved_args(op);
        let boxes: SmallVec<[BoxId; 2]> =
            args.iter().map(|&a| self.materialize(a)).collect();
        let r = self.new_result(op);
        self.out.push(
            ResOp::new(Opcode::NewArray, boxes)
                .with_result(r)
                .with_extra(op.extra),
        );
        self.bind(op, OptValue::Box(r));
    }

    fn get_item(&mut self, op: &ResOp) {
        let arr = self.resolve(op.args[0]);
        let index = self.resolve(op.args[1]);
        if self.config.cache_heap {
            if let Some(v) = self.heap_cache.get_item(arr, index) {
                self.bind(op, self.normalize(v));
                return;
            }
        }
        let ab = self.materialize(arr);
        let ib = self.materialize(index);
        let r = self.new_result(op);
        self.out
            .push(ResOp::new(Opcode::GetItem, smallvec![ab, ib]).with_result(r));
        if self.config.cache_heap {
            self.heap_cache.record_item(arr, index, OptValue::Box(r));
        }
        self.bind(op, OptValue::Box(r));
    }

    fn set_item(&mut self, op: &ResOp) {
        let arr = self.resolve(op.args[0]);
        let index = self.resolve(op.args[1]);
        let val = self.resolve(op.args[2]);
        let ab = self.materialize(arr);
        let ib = self.materialize(index);
        let vb = self.materialize(val);
        self.out
            .push(ResOp::new(Opcode::SetItem, smallvec![ab, ib, vb]));
        if self.config.cache_heap {
            let stored = self.normalize(val);
            self.heap_cache.write_item(arr, index, stored);
        }
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    fn call_op(&mut self, op: &ResOp) {
        let func = match op.extra {
            OpExtra::Func(f) => f,
            _ => unreachable!("calls carry a callee"),
        };
        let args = self.resolved_args(op);

        if op.opcode == Opcode::CallPure && self.config.fold_pure {
            if let Some(values) = all_const(&args) {
                // Pure functions are heap-independent by the embedder's
                // declaration, so executing against a scratch heap is
                // sound. A raising or reference-producing call stays
                // residual.
                let mut scratch = Heap::new();
                if let Ok(v) = interp::run_plain(self.program, &mut scratch, func, &values) {
                    if v.kind() != ValueKind::Ref {
                        self.bind(op, OptValue::Const(v));
                        return;
                    }
                }
            }
        }
        if op.opcode != Opcode::Call && self.config.fold_pure {
            if let Some(hit) = self.pure.lookup(op.opcode, &args, ExtraKey::Func(func)) {
                self.bind(op, hit);
                return;
            }
        }

        let boxes: SmallVec<[BoxId; 2]> =
            args.iter().map(|&a| self.materialize(a)).collect();
        let r = self.new_result(op);
        self.out
            .push(ResOp::new(op.opcode, boxes).with_result(r).with_extra(op.extra));
        if op.opcode == Opcode::Call {
            if self.config.cache_heap {
                self.heap_cache.across_call(self.gc);
            }
        } else if self.config.fold_pure {
            self.pure
                .insert(op.opcode, args, ExtraKey::Func(func), OptValue::Box(r));
        }
        self.bind(op, OptValue::Box(r));
    }

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------

    fn emit_guard(&mut self, op: &ResOp, args: SmallVec<[BoxId; 2]>) {
        let snapshot = self.remap_snapshot(op.snapshot.expect("guard has a snapshot"));
        self.out.push(
            ResOp::new(op.opcode, args)
                .with_extra(op.extra)
                .with_snapshot(snapshot),
        );
    }

    fn guard_op(&mut self, op: &ResOp) {
        use Opcode::*;
        let arg0 = self.resolve(op.args[0]);
        match op.opcode {
            GuardTrue | GuardFalse => {
                let want = op.opcode == GuardTrue;
                if let OptValue::Const(c) = arg0 {
                    debug_assert_eq!(c.is_truthy(), want);
                    return;
                }
                if self.config.strengthen_guards {
                    if self.facts.known_truthy(arg0) == Some(want) {
                        return;
                    }
                    if self.strengthen_compare(op, arg0, want) {
                        return;
                    }
                }
                let b = self.materialize(arg0);
                self.emit_guard(op, smallvec![b]);
                self.facts.set_truthy(arg0, want);
            }
            GuardValue => {
                let expect = self.resolve(op.args[1]);
                if arg0 == expect {
                    return;
                }
                let a = self.materialize(arg0);
                let e = self.materialize(expect);
                self.emit_guard(op, smallvec![a, e]);
                if let (OptValue::Box(b), OptValue::Const(c)) = (arg0, expect) {
                    self.rewrites.insert(b, OptValue::Const(c));
                }
            }
            GuardClass => {
                let shape = match op.extra {
                    OpExtra::Shape(s) => s,
                    _ => unreachable!("GuardClass carries a shape"),
                };
                match arg0 {
                    // The class of a removed allocation or a fixed object
                    // is statically known.
                    OptValue::Virtual(_) | OptValue::Const(_) => {}
                    OptValue::Box(_) => {
                        if self.config.strengthen_guards
                            && self.facts.known_shape(arg0) == Some(shape)
                        {
                            return;
                        }
                        let b = self.materialize(arg0);
                        self.emit_guard(op, smallvec![b]);
                        self.facts.set_shape(arg0, shape);
                    }
                }
            }
            GuardNonNull => match arg0 {
                OptValue::Virtual(_) | OptValue::Const(_) => {}
                OptValue::Box(_) => {
                    if self.config.strengthen_guards && self.facts.is_nonnull(arg0) {
                        return;
                    }
                    let b = self.materialize(arg0);
                    self.emit_guard(op, smallvec![b]);
                    self.facts.set_nonnull(arg0);
                }
            },
            _ => unreachable!("guard_op only sees guards"),
        }
    }

    /// `GuardTrue(IntEq(x, c))` (and `GuardFalse(IntNe(x, c))`) pin `x` to
    /// the constant: re-emit as `GuardValue(x, c)` and treat `x` as `c`
    /// from here on.
    fn strengthen_compare(&mut self, op: &ResOp, cond: OptValue, want: bool) -> bool {
        let OptValue::Box(cond_box) = cond else {
            return false;
        };
        let Some((pop, pargs)) = self.producers.get(&cond_box).cloned() else {
            return false;
        };
        let eq_like = (want && pop == Opcode::IntEq) || (!want && pop == Opcode::IntNe);
        if !eq_like {
            return false;
        }
        let Some((x, c)) = split_var_const(&pargs) else {
            return false;
        };
        let xb = self.materialize(x);
        let cb = self.const_box(c);
        let snapshot = self.remap_snapshot(op.snapshot.expect("guard has a snapshot"));
        self.out.push(
            ResOp::new(Opcode::GuardValue, smallvec![xb, cb]).with_snapshot(snapshot),
        );
        // The comparison's result and its variable operand are now fixed.
        self.rewrites
            .insert(cond_box, OptValue::Const(Value::Int(want as i64)));
        if let OptValue::Box(xb) = x {
            self.rewrites.insert(xb, OptValue::Const(c));
        }
        self.facts.set_truthy(cond, want);
        true
    }

    // -------------------------------------------------------------------------
    // Back-edge
    // -------------------------------------------------------------------------

    fn jump_op(&mut self, op: &ResOp) {
        // Everything still virtual that flows into the next iteration must
        // exist for real by now.
        let boxes: SmallVec<[BoxId; 2]> = op
            .args
            .iter()
            .map(|&a| {
                let v = self.resolve(a);
                self.materialize(v)
            })
            .collect();
        self.out
            .push(ResOp::new(Opcode::Jump, boxes).with_extra(op.extra));
    }
}

fn all_const(args: &[OptValue]) -> Option<Vec<Value>> {
    args.iter()
        .map(|a| match a {
            OptValue::Const(v) => Some(*v),
            _ => None,
        })
        .collect()
}

fn split_var_const(args: &[OptValue]) -> Option<(OptValue, Value)> {
    match *args {
        [x, OptValue::Const(c)] if !matches!(x, OptValue::Const(_)) => Some((x, c)),
        [OptValue::Const(c), x] if !matches!(x, OptValue::Const(_)) => Some((x, c)),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitcode::FuncId;
    use crate::resume::FrameSnapshot;
    use crate::trace::ops::JumpTarget;
    use molten_core::Shape;
    use smallvec::smallvec;

    fn pair_program() -> Program {
        let mut program = Program::new();
        program.add_shape(Shape::new(
            "pair",
            vec![
                ("x".into(), ValueKind::Int),
                ("y".into(), ValueKind::Int),
            ],
        ));
        program
    }

    fn dummy_snapshot(trace: &mut Trace, regs: Vec<ResumeSlot>) -> SnapshotId {
        trace.add_snapshot(Snapshot {
            frames: smallvec![FrameSnapshot {
                func: FuncId(0),
                pc: 0,
                regs,
                ret_dst: None,
            }],
        })
    }

    fn optimize_default(program: &Program, trace: &Trace) -> Trace {
        let out = optimize(program, &GcConfig::new(), OptConfig::default(), trace);
        out.validate().unwrap();
        out
    }

    #[test]
    fn constant_folding_and_cse() {
        let program = Program::new();
        let mut t = Trace::new();
        let x = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        let c2 = t.new_const(Value::Int(2));
        let c3 = t.new_const(Value::Int(3));
        // s = 2 + 3 (folds); a = x + 2; b = x + 2 (CSE); jump(b)
        let s = t.new_var(ValueKind::Int);
        t.push(ResOp::new(Opcode::IntAdd, smallvec![c2, c3]).with_result(s));
        let a = t.new_var(ValueKind::Int);
        t.push(ResOp::new(Opcode::IntAdd, smallvec![x, c2]).with_result(a));
        let b = t.new_var(ValueKind::Int);
        t.push(ResOp::new(Opcode::IntAdd, smallvec![x, c2]).with_result(b));
        t.push(
            ResOp::new(Opcode::Jump, smallvec![b])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        assert_eq!(out.body_len(), 1);
    }

    #[test]
    fn store_to_load_forwarding() {
        let program = pair_program();
        let shape = molten_core::ShapeId(0);
        let mut t = Trace::new();
        let o = t.add_label_arg(ValueKind::Ref);
        let v = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        t.push(
            ResOp::new(Opcode::SetField, smallvec![o, v])
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        let r = t.new_var(ValueKind::Int);
        t.push(
            ResOp::new(Opcode::GetField, smallvec![o])
                .with_result(r)
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        t.push(
            ResOp::new(Opcode::Jump, smallvec![o, r])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        // The read is forwarded from the write; only SetField remains.
        assert_eq!(out.body_len(), 1);
    }

    #[test]
    fn unescaping_allocation_disappears() {
        let program = pair_program();
        let shape = molten_core::ShapeId(0);
        let mut t = Trace::new();
        let x = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        let p = t.new_var(ValueKind::Ref);
        t.push(
            ResOp::new(Opcode::NewStruct, smallvec![])
                .with_result(p)
                .with_extra(OpExtra::Shape(shape)),
        );
        t.push(
            ResOp::new(Opcode::SetField, smallvec![p, x])
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        let g = t.new_var(ValueKind::Int);
        t.push(
            ResOp::new(Opcode::GetField, smallvec![p])
                .with_result(g)
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        t.push(
            ResOp::new(Opcode::Jump, smallvec![g])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        assert_eq!(out.body_len(), 0);
    }

    #[test]
    fn escaping_allocation_is_forced() {
        let program = pair_program();
        let shape = molten_core::ShapeId(0);
        let mut t = Trace::new();
        let o = t.add_label_arg(ValueKind::Ref);
        let x = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        let p = t.new_var(ValueKind::Ref);
        t.push(
            ResOp::new(Opcode::NewStruct, smallvec![])
                .with_result(p)
                .with_extra(OpExtra::Shape(shape)),
        );
        t.push(
            ResOp::new(Opcode::SetField, smallvec![p, x])
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        // Store the virtual into a real object: it escapes.
        t.push(
            ResOp::new(Opcode::SetField, smallvec![o, p])
                .with_extra(OpExtra::Field { shape, field: 1 }),
        );
        t.push(
            ResOp::new(Opcode::Jump, smallvec![o, x])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        // NewStruct + writeback of field 0 + the escaping store.
        assert_eq!(out.body_len(), 3);
        assert!(out
            .ops
            .iter()
            .any(|op| op.opcode == Opcode::NewStruct));
    }

    #[test]
    fn redundant_class_guards_collapse() {
        let program = pair_program();
        let shape = molten_core::ShapeId(0);
        let mut t = Trace::new();
        let o = t.add_label_arg(ValueKind::Ref);
        t.seal_label();
        let s1 = dummy_snapshot(&mut t, vec![ResumeSlot::Live(o)]);
        t.push(
            ResOp::new(Opcode::GuardClass, smallvec![o])
                .with_extra(OpExtra::Shape(shape))
                .with_snapshot(s1),
        );
        let s2 = dummy_snapshot(&mut t, vec![ResumeSlot::Live(o)]);
        t.push(
            ResOp::new(Opcode::GuardClass, smallvec![o])
                .with_extra(OpExtra::Shape(shape))
                .with_snapshot(s2),
        );
        t.push(
            ResOp::new(Opcode::Jump, smallvec![o])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        assert_eq!(out.guard_count(), 1);
    }

    #[test]
    fn snapshot_describes_removed_allocation() {
        let program = pair_program();
        let shape = molten_core::ShapeId(0);
        let mut t = Trace::new();
        let x = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        let p = t.new_var(ValueKind::Ref);
        t.push(
            ResOp::new(Opcode::NewStruct, smallvec![])
                .with_result(p)
                .with_extra(OpExtra::Shape(shape)),
        );
        t.push(
            ResOp::new(Opcode::SetField, smallvec![p, x])
                .with_extra(OpExtra::Field { shape, field: 0 }),
        );
        let cond = t.new_var(ValueKind::Int);
        let ten = t.new_const(Value::Int(10));
        t.push(ResOp::new(Opcode::IntLt, smallvec![x, ten]).with_result(cond));
        let snap = dummy_snapshot(&mut t, vec![ResumeSlot::Live(p), ResumeSlot::Live(x)]);
        t.push(
            ResOp::new(Opcode::GuardTrue, smallvec![cond]).with_snapshot(snap),
        );
        t.push(
            ResOp::new(Opcode::Jump, smallvec![x])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        // The allocation is gone, the guard remains.
        assert!(!out.ops.iter().any(|op| op.opcode == Opcode::NewStruct));
        assert_eq!(out.guard_count(), 1);
        // Its snapshot names the object virtually, first field = x.
        assert_eq!(out.virtuals.len(), 1);
        let guard = out
            .ops
            .iter()
            .find(|op| op.opcode == Opcode::GuardTrue)
            .unwrap();
        let snap = &out.snapshots[guard.snapshot.unwrap()];
        assert!(matches!(snap.frames[0].regs[0], ResumeSlot::Virtual(_)));
    }

    #[test]
    fn eq_guard_promotes_to_value_guard() {
        let program = Program::new();
        let mut t = Trace::new();
        let x = t.add_label_arg(ValueKind::Int);
        t.seal_label();
        let c7 = t.new_const(Value::Int(7));
        let cond = t.new_var(ValueKind::Int);
        t.push(ResOp::new(Opcode::IntEq, smallvec![x, c7]).with_result(cond));
        let snap = dummy_snapshot(&mut t, vec![ResumeSlot::Live(x)]);
        t.push(ResOp::new(Opcode::GuardTrue, smallvec![cond]).with_snapshot(snap));
        // x is 7 downstream: x + 1 folds to 8.
        let one = t.new_const(Value::Int(1));
        let y = t.new_var(ValueKind::Int);
        t.push(ResOp::new(Opcode::IntAdd, smallvec![x, one]).with_result(y));
        t.push(
            ResOp::new(Opcode::Jump, smallvec![y])
                .with_extra(OpExtra::Target(JumpTarget::SelfLabel)),
        );

        let out = optimize_default(&program, &t);
        assert!(out.ops.iter().any(|op| op.opcode == Opcode::GuardValue));
        assert!(!out.ops.iter().any(|op| op.opcode == Opcode::IntAdd));
        // The jump now passes the folded constant 8.
        let jump = out.ops.last().unwrap();
        assert_eq!(out.const_value(jump.args[0]), Some(Value::Int(8)));
    }
}
