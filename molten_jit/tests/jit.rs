//! End-to-end scenarios: the engine-driven interpreter against the plain
//! one, over programs built with `FunctionBuilder`. Every test asserts the
//! observable result is identical and then pins down *how* the JIT ran via
//! the engine's counters.

use molten_core::{Heap, Shape, Value, ValueKind, VmError};
use molten_jit::jitcode::{BinOp, CallEffect, FuncId, FunctionBuilder, Instr, LoopSite, Program, Reg};
use molten_jit::{interp, Engine, JitParams};

fn params(threshold: u32, trace_eagerness: u32) -> JitParams {
    JitParams {
        threshold,
        trace_eagerness,
        ..JitParams::default()
    }
}

fn run_both(
    program: &Program,
    func: FuncId,
    args: &[Value],
    params: JitParams,
) -> (Result<Value, VmError>, Result<Value, VmError>, Engine, Heap) {
    let mut plain_heap = Heap::new();
    let plain = interp::run_plain(program, &mut plain_heap, func, args);

    let mut engine = Engine::new(params);
    let mut jit_heap = Heap::new();
    let jit = interp::run(program, &mut jit_heap, &mut engine, func, args);
    (plain, jit, engine, jit_heap)
}

// -----------------------------------------------------------------------------
// Arithmetic loop
// -----------------------------------------------------------------------------

// sum(n): s = 0; while n > 0 { s += n; n -= 1 }; return s
fn sum_program() -> (Program, FuncId) {
    let mut program = Program::new();
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(0), Reg(1)],
    });
    let mut b = FunctionBuilder::new("sum", 1, 5);
    let (n, s, zero, one, cond) = (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4));
    b.load_const(s, Value::Int(0));
    b.load_const(zero, Value::Int(0));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
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
fn arithmetic_loop_matches_the_interpreter() {
    let (program, func) = sum_program();
    let (plain, jit, engine, _) = run_both(&program, func, &[Value::Int(500)], params(3, 100));
    assert_eq!(plain, Ok(Value::Int(125250)));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    assert!(stats.enter_compiled >= 1);
    // The residual loop body is four operations: compare, guard, add, sub.
    assert_eq!(stats.ops_after_opt, 4);
}

// mul(a, b) by repeated addition; the loop body compiles down to one
// compare-and-guard, one add and one sub.
#[test]
fn multiply_by_repeated_addition() {
    let mut program = Program::new();
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(0), Reg(1), Reg(2)],
    });
    let mut b = FunctionBuilder::new("mul", 2, 6);
    let (a, n, res, zero, one, cond) = (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5));
    b.load_const(res, Value::Int(0));
    b.load_const(zero, Value::Int(0));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntGt, cond, n, zero);
    b.jump_if_false(cond, out);
    b.binary(BinOp::IntAdd, res, res, a);
    b.binary(BinOp::IntSub, n, n, one);
    b.jump(top);
    b.bind(out);
    b.ret(res);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();

    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(6), Value::Int(7)],
        params(2, 100),
    );
    assert_eq!(plain, Ok(Value::Int(42)));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    assert_eq!(stats.ops_after_opt, 4);
}

#[test]
fn trace_limit_aborts_but_preserves_semantics() {
    let (program, func) = sum_program();
    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(200)],
        JitParams {
            threshold: 3,
            trace_limit: 2,
            ..JitParams::default()
        },
    );
    assert_eq!(jit, plain);
    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 0);
    assert!(stats.aborts_trace_too_long >= 1);
}

// -----------------------------------------------------------------------------
// Polymorphic loop and bridges
// -----------------------------------------------------------------------------

// Alternates between two object shapes inside the loop, so the class guard
// recorded for one shape keeps failing for the other.
//
// poly(n): arr = [A { x: 1 }, B { x: 2, y: 0 }]
//          s = 0; for i in 0..n { s += arr[i % 2].x }; return s
fn poly_program() -> (Program, FuncId) {
    let mut program = Program::new();
    let shape_a = program.add_shape(Shape::new("a", vec![("x".into(), ValueKind::Int)]));
    let shape_b = program.add_shape(Shape::new(
        "b",
        vec![("x".into(), ValueKind::Int), ("y".into(), ValueKind::Int)],
    ));
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(3), Reg(2), Reg(0), Reg(1)],
    });

    let mut b = FunctionBuilder::new("poly", 1, 10);
    let (n, arr, s, i, cond, k, o, v, two, one) = (
        Reg(0),
        Reg(1),
        Reg(2),
        Reg(3),
        Reg(4),
        Reg(5),
        Reg(6),
        Reg(7),
        Reg(8),
        Reg(9),
    );
    b.load_const(two, Value::Int(2));
    b.load_const(one, Value::Int(1));
    b.load_const(s, Value::Int(0));
    b.load_const(i, Value::Int(0));
    b.emit(Instr::NewArray {
        dst: arr,
        kind: ValueKind::Ref,
        len: two,
    });
    // arr[0] = A { x: 1 }
    b.emit(Instr::New {
        dst: o,
        shape: shape_a,
    });
    b.load_const(v, Value::Int(1));
    b.emit(Instr::SetField {
        obj: o,
        field: 0,
        src: v,
    });
    b.load_const(k, Value::Int(0));
    b.emit(Instr::SetItem {
        arr,
        index: k,
        src: o,
    });
    // arr[1] = B { x: 2, y: 0 }
    b.emit(Instr::New {
        dst: o,
        shape: shape_b,
    });
    b.load_const(v, Value::Int(2));
    b.emit(Instr::SetField {
        obj: o,
        field: 0,
        src: v,
    });
    b.load_const(k, Value::Int(1));
    b.emit(Instr::SetItem {
        arr,
        index: k,
        src: o,
    });

    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntLt, cond, i, n);
    b.jump_if_false(cond, out);
    b.binary(BinOp::IntMod, k, i, two);
    b.emit(Instr::GetItem {
        dst: o,
        arr,
        index: k,
    });
    b.emit(Instr::GetField {
        dst: v,
        obj: o,
        field: 0,
    });
    b.binary(BinOp::IntAdd, s, s, v);
    b.binary(BinOp::IntAdd, i, i, one);
    b.jump(top);
    b.bind(out);
    b.ret(s);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();
    (program, func)
}

#[test]
fn class_guard_grows_a_bridge() {
    let (program, func) = poly_program();
    let (plain, jit, engine, _) = run_both(&program, func, &[Value::Int(200)], params(3, 2));
    assert_eq!(plain, Ok(Value::Int(300)));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    assert!(stats.bridges_compiled >= 1);
    assert!(stats.guard_failures >= 2);
}

#[test]
fn retrace_limit_zero_goes_generic_instead_of_bridging() {
    let (program, func) = poly_program();
    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(100)],
        JitParams {
            threshold: 3,
            trace_eagerness: 2,
            retrace_limit: 0,
            ..JitParams::default()
        },
    );
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.bridges_compiled, 0);
    assert!(stats.generic_bridges >= 1);
    // Every failure past that point deoptimizes.
    assert!(stats.blackhole_runs >= 1);
}

// -----------------------------------------------------------------------------
// Allocation removal
// -----------------------------------------------------------------------------

// churn(n): per iteration, allocate a pair, write a field, read it back.
// The pair never escapes the iteration.
fn churn_program() -> (Program, FuncId) {
    let mut program = Program::new();
    let shape = program.add_shape(Shape::new("pair", vec![("x".into(), ValueKind::Int)]));
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(2), Reg(1), Reg(0)],
    });

    let mut b = FunctionBuilder::new("churn", 1, 7);
    let (n, s, i, cond, p, v, one) = (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5), Reg(6));
    b.load_const(s, Value::Int(0));
    b.load_const(i, Value::Int(0));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntLt, cond, i, n);
    b.jump_if_false(cond, out);
    b.emit(Instr::New { dst: p, shape });
    b.emit(Instr::SetField {
        obj: p,
        field: 0,
        src: i,
    });
    b.emit(Instr::GetField {
        dst: v,
        obj: p,
        field: 0,
    });
    b.binary(BinOp::IntAdd, s, s, v);
    b.binary(BinOp::IntAdd, i, i, one);
    b.jump(top);
    b.bind(out);
    b.ret(s);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();
    (program, func)
}

#[test]
fn non_escaping_allocations_disappear_from_compiled_code() {
    let (program, func) = churn_program();
    let (plain, jit, engine, jit_heap) =
        run_both(&program, func, &[Value::Int(100)], params(3, 100));
    assert_eq!(plain, Ok(Value::Int(4950)));
    assert_eq!(jit, plain);

    let mut plain_heap = Heap::new();
    interp::run_plain(&program, &mut plain_heap, func, &[Value::Int(100)]).unwrap();
    // Interpreted, every iteration allocates; compiled, none do. Only the
    // warm-up iterations' objects exist on the JIT side.
    assert_eq!(plain_heap.len(), 100);
    assert!(jit_heap.len() <= 5);

    let stats = engine.stats();
    assert!(stats.ops_after_opt < stats.ops_recorded);
}

// -----------------------------------------------------------------------------
// Exceptions
// -----------------------------------------------------------------------------

// blowup(n): i = 0; loop { d = n - i; s += 100 / d; i += 1 } — raises when
// i reaches n, from inside compiled code once the loop is hot.
fn blowup_program() -> (Program, FuncId) {
    let mut program = Program::new();
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(2), Reg(1), Reg(0)],
    });
    let mut b = FunctionBuilder::new("blowup", 1, 7);
    let (n, s, i, d, q, hundred, one) =
        (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5), Reg(6));
    b.load_const(s, Value::Int(0));
    b.load_const(i, Value::Int(0));
    b.load_const(hundred, Value::Int(100));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntSub, d, n, i);
    b.binary(BinOp::IntDiv, q, hundred, d);
    b.binary(BinOp::IntAdd, s, s, q);
    b.binary(BinOp::IntAdd, i, i, one);
    b.jump(top);
    b.ret(s);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();
    (program, func)
}

#[test]
fn exceptions_from_compiled_code_match_the_interpreter() {
    let (program, func) = blowup_program();
    let (plain, jit, engine, _) = run_both(&program, func, &[Value::Int(50)], params(3, 100));
    assert_eq!(plain, Err(VmError::DivisionByZero));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    assert!(stats.enter_compiled >= 1);
    // The divisor guard failed and deoptimization re-raised concretely.
    assert!(stats.guard_failures >= 1);
}

// -----------------------------------------------------------------------------
// Calls
// -----------------------------------------------------------------------------

// Loop body calls a helper; once the helper is hot it is traced inline.
fn call_program(effect: CallEffect) -> (Program, FuncId) {
    let mut program = Program::new();

    let mut helper = FunctionBuilder::new("triple", 1, 3);
    helper.load_const(Reg(1), Value::Int(3));
    helper.binary(BinOp::IntMul, Reg(2), Reg(0), Reg(1));
    helper.ret(Reg(2));
    let triple = program.add_function(helper.effect(effect).finish().unwrap());

    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(2), Reg(1), Reg(0)],
    });
    let mut b = FunctionBuilder::new("main", 1, 7);
    let (n, s, i, cond, base, one) = (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(6));
    b.load_const(s, Value::Int(0));
    b.load_const(i, Value::Int(0));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntLt, cond, i, n);
    b.jump_if_false(cond, out);
    b.emit(Instr::Move { dst: base, src: i });
    b.call(Reg(5), triple, base, 1);
    b.binary(BinOp::IntAdd, s, s, Reg(5));
    b.binary(BinOp::IntAdd, i, i, one);
    b.jump(top);
    b.bind(out);
    b.ret(s);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();
    (program, func)
}

#[test]
fn hot_helper_calls_are_traced_inline() {
    let (program, func) = call_program(CallEffect::Opaque);
    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(100)],
        JitParams {
            threshold: 5,
            function_threshold: 2,
            trace_eagerness: 100,
            ..JitParams::default()
        },
    );
    assert_eq!(plain, Ok(Value::Int(14850)));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    // Inlined: the compiled body carries the helper's multiply, not a
    // residual call. compare + guard + mul + add + add.
    assert_eq!(stats.ops_after_opt, 5);
}

#[test]
fn cold_helper_calls_stay_residual() {
    let (program, func) = call_program(CallEffect::Opaque);
    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(100)],
        JitParams {
            threshold: 5,
            function_threshold: 1_000_000,
            trace_eagerness: 100,
            ..JitParams::default()
        },
    );
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    // compare + guard + residual call + add + add.
    assert_eq!(stats.ops_after_opt, 5);
}

#[test]
fn pure_helper_with_constant_argument_folds_away() {
    let mut program = Program::new();

    let mut helper = FunctionBuilder::new("square", 1, 2);
    helper.binary(BinOp::IntMul, Reg(1), Reg(0), Reg(0));
    helper.ret(Reg(1));
    let square = program.add_function(helper.effect(CallEffect::Pure).finish().unwrap());

    // s += square(7) every iteration; the call folds to 49 at trace time.
    let site = program.add_site(LoopSite {
        greens: vec![],
        reds: vec![Reg(2), Reg(1), Reg(0)],
    });
    let mut b = FunctionBuilder::new("main", 1, 7);
    let (n, s, i, cond, seven, one) = (Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(6));
    b.load_const(s, Value::Int(0));
    b.load_const(i, Value::Int(0));
    b.load_const(one, Value::Int(1));
    let top = b.new_label();
    let out = b.new_label();
    b.bind(top);
    b.loop_header(site);
    b.binary(BinOp::IntLt, cond, i, n);
    b.jump_if_false(cond, out);
    b.load_const(seven, Value::Int(7));
    b.call(Reg(5), square, seven, 1);
    b.binary(BinOp::IntAdd, s, s, Reg(5));
    b.binary(BinOp::IntAdd, i, i, one);
    b.jump(top);
    b.bind(out);
    b.ret(s);
    let func = program.add_function(b.finish().unwrap());
    program.validate().unwrap();

    let (plain, jit, engine, _) = run_both(
        &program,
        func,
        &[Value::Int(100)],
        JitParams {
            threshold: 3,
            trace_eagerness: 100,
            inlining: false,
            ..JitParams::default()
        },
    );
    assert_eq!(plain, Ok(Value::Int(4900)));
    assert_eq!(jit, plain);

    let stats = engine.stats();
    assert_eq!(stats.loops_compiled, 1);
    // compare + guard + add + add; no trace of the call.
    assert_eq!(stats.ops_after_opt, 4);
}
