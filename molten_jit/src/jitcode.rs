//! Jitcode: the flat bytecode the tracer walks.
//!
//! Jitcode is already lowered by the embedding toolchain; every instruction
//! is an opcode plus fixed-width operand slots (`Reg` and small indices).
//! There is no implicit state beyond the register file of the current frame:
//! calls pass a contiguous register window, branches are absolute targets,
//! and `LoopHeader` marks the interpreter call-points (`loop_header` /
//! `can_enter_jit`) with the green/red split declared on the program.
//!
//! The `FunctionBuilder` exists for embedders and tests; it does forward
//! label patching so loops read naturally.

use molten_core::{CodeError, Shape, ShapeId, Value, ValueKind};
use std::fmt;

// =============================================================================
// Handles
// =============================================================================

/// A virtual register of a jitcode frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u16);

/// Index of a function in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Index of a loop site (a `LoopHeader` call-point) in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

// =============================================================================
// Instruction Set
// =============================================================================

/// Pure binary operators. Integer arithmetic wraps; comparisons produce
/// `Int(0)` or `Int(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    IntMod,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
}

impl BinOp {
    /// Division and modulo raise on a zero divisor; everything else is total.
    #[inline]
    pub fn can_raise(self) -> bool {
        matches!(self, BinOp::IntDiv | BinOp::IntMod)
    }

    /// Result kind of the operator.
    #[inline]
    pub fn result_kind(self) -> ValueKind {
        match self {
            BinOp::IntAdd
            | BinOp::IntSub
            | BinOp::IntMul
            | BinOp::IntDiv
            | BinOp::IntMod
            | BinOp::IntLt
            | BinOp::IntLe
            | BinOp::IntEq
            | BinOp::IntNe
            | BinOp::IntGt
            | BinOp::IntGe
            | BinOp::FloatLt
            | BinOp::FloatLe
            | BinOp::FloatEq
            | BinOp::FloatNe
            | BinOp::FloatGt
            | BinOp::FloatGe => ValueKind::Int,
            BinOp::FloatAdd | BinOp::FloatSub | BinOp::FloatMul | BinOp::FloatDiv => {
                ValueKind::Float
            }
        }
    }
}

/// Pure unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    IntNeg,
    FloatNeg,
    IntToFloat,
}

impl UnOp {
    #[inline]
    pub fn result_kind(self) -> ValueKind {
        match self {
            UnOp::IntNeg => ValueKind::Int,
            UnOp::FloatNeg | UnOp::IntToFloat => ValueKind::Float,
        }
    }
}

/// One jitcode instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    LoadConst { dst: Reg, index: u16 },
    Move { dst: Reg, src: Reg },
    Binary { op: BinOp, dst: Reg, lhs: Reg, rhs: Reg },
    Unary { op: UnOp, dst: Reg, src: Reg },
    Jump { target: u32 },
    JumpIfTrue { cond: Reg, target: u32 },
    JumpIfFalse { cond: Reg, target: u32 },
    /// Interpreter call-point: candidate to start tracing or to enter
    /// compiled code. Greens/reds are declared on the site.
    LoopHeader { site: SiteId },
    New { dst: Reg, shape: ShapeId },
    GetField { dst: Reg, obj: Reg, field: u16 },
    SetField { obj: Reg, field: u16, src: Reg },
    NewArray { dst: Reg, kind: ValueKind, len: Reg },
    GetItem { dst: Reg, arr: Reg, index: Reg },
    SetItem { arr: Reg, index: Reg, src: Reg },
    ArrayLen { dst: Reg, arr: Reg },
    /// Call `func` with arguments in `base .. base + nargs`.
    Call { dst: Reg, func: FuncId, base: Reg, nargs: u16 },
    Return { src: Reg },
}

// =============================================================================
// Functions and Sites
// =============================================================================

/// Side-effect classification of a function, supplied by the embedder. This
/// is the configuration table deciding fold-vs-guarded-call legality for
/// residual calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallEffect {
    /// May read and write anything; always a residual call in traces.
    #[default]
    Opaque,
    /// Result determined by arguments, but may raise: cacheable within a
    /// trace, never folded at trace time.
    Elidable,
    /// Total and side-effect free: folded when all arguments are constant.
    Pure,
}

/// A jitcode function. Arguments arrive in registers `0 .. arity`.
#[derive(Debug, Clone)]
pub struct JitFunction {
    pub name: String,
    pub arity: u16,
    pub num_regs: u16,
    pub consts: Vec<Value>,
    pub code: Vec<Instr>,
    pub effect: CallEffect,
}

/// The green/red split of a loop header: greens are control-determining and
/// must be equal for two executions to share a trace; reds are free data.
#[derive(Debug, Clone)]
pub struct LoopSite {
    pub greens: Vec<Reg>,
    pub reds: Vec<Reg>,
}

// =============================================================================
// Trace Policy
// =============================================================================

/// Per-call-site policy hooks supplied by the embedding interpreter,
/// consulted before any counting. Explicit function values, not reflection.
pub struct TracePolicy {
    pub can_never_inline: Box<dyn Fn(FuncId) -> bool>,
    pub should_unroll_one_iteration: Box<dyn Fn(SiteId) -> bool>,
}

impl Default for TracePolicy {
    fn default() -> Self {
        TracePolicy {
            can_never_inline: Box::new(|_| false),
            should_unroll_one_iteration: Box::new(|_| false),
        }
    }
}

// `Box<dyn Fn>` has no Debug; show the struct opaquely.
impl fmt::Debug for TracePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TracePolicy { .. }")
    }
}

// =============================================================================
// Program
// =============================================================================

/// A whole jitcode program: functions, shapes, loop sites and policy.
#[derive(Debug, Default)]
pub struct Program {
    pub functions: Vec<JitFunction>,
    pub shapes: Vec<Shape>,
    pub sites: Vec<LoopSite>,
    pub policy: TracePolicy,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn add_shape(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    pub fn add_site(&mut self, site: LoopSite) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(site);
        id
    }

    pub fn add_function(&mut self, func: JitFunction) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    #[inline]
    pub fn function(&self, id: FuncId) -> &JitFunction {
        &self.functions[id.0 as usize]
    }

    #[inline]
    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.0 as usize]
    }

    #[inline]
    pub fn site(&self, id: SiteId) -> &LoopSite {
        &self.sites[id.0 as usize]
    }

    /// Structural validation: every register, constant, branch target,
    /// callee, shape and site in range, and no function that can run off the
    /// end of its code.
    pub fn validate(&self) -> Result<(), CodeError> {
        for (fidx, func) in self.functions.iter().enumerate() {
            let fid = fidx as u32;
            let nregs = func.num_regs;
            let check_reg = |r: Reg| -> Result<(), CodeError> {
                if r.0 >= nregs {
                    Err(CodeError::BadRegister {
                        func: fid,
                        reg: r.0,
                        num_regs: nregs,
                    })
                } else {
                    Ok(())
                }
            };
            let check_target = |t: u32| -> Result<(), CodeError> {
                if t as usize >= func.code.len() {
                    Err(CodeError::BadTarget { func: fid, target: t })
                } else {
                    Ok(())
                }
            };

            match func.code.last() {
                Some(Instr::Return { .. }) | Some(Instr::Jump { .. }) => {}
                _ => return Err(CodeError::MissingReturn { func: fid }),
            }

            for instr in &func.code {
                match *instr {
                    Instr::LoadConst { dst, index } => {
                        check_reg(dst)?;
                        if index as usize >= func.consts.len() {
                            return Err(CodeError::BadConstant { func: fid, index });
                        }
                    }
                    Instr::Move { dst, src } => {
                        check_reg(dst)?;
                        check_reg(src)?;
                    }
                    Instr::Binary { dst, lhs, rhs, .. } => {
                        check_reg(dst)?;
                        check_reg(lhs)?;
                        check_reg(rhs)?;
                    }
                    Instr::Unary { dst, src, .. } => {
                        check_reg(dst)?;
                        check_reg(src)?;
                    }
                    Instr::Jump { target } => check_target(target)?,
                    Instr::JumpIfTrue { cond, target } | Instr::JumpIfFalse { cond, target } => {
                        check_reg(cond)?;
                        check_target(target)?;
                    }
                    Instr::LoopHeader { site } => {
                        let s = self
                            .sites
                            .get(site.0 as usize)
                            .ok_or(CodeError::BadSite { func: fid, site: site.0 })?;
                        for &r in s.greens.iter().chain(s.reds.iter()) {
                            check_reg(r)?;
                        }
                    }
                    Instr::New { dst, shape } => {
                        check_reg(dst)?;
                        if shape.0 as usize >= self.shapes.len() {
                            return Err(CodeError::BadShape { func: fid, shape: shape.0 });
                        }
                    }
                    Instr::GetField { dst, obj, .. } => {
                        check_reg(dst)?;
                        check_reg(obj)?;
                    }
                    Instr::SetField { obj, src, .. } => {
                        check_reg(obj)?;
                        check_reg(src)?;
                    }
                    Instr::NewArray { dst, len, .. } => {
                        check_reg(dst)?;
                        check_reg(len)?;
                    }
                    Instr::GetItem { dst, arr, index } => {
                        check_reg(dst)?;
                        check_reg(arr)?;
                        check_reg(index)?;
                    }
                    Instr::SetItem { arr, index, src } => {
                        check_reg(arr)?;
                        check_reg(index)?;
                        check_reg(src)?;
                    }
                    Instr::ArrayLen { dst, arr } => {
                        check_reg(dst)?;
                        check_reg(arr)?;
                    }
                    Instr::Call { dst, func: callee, base, nargs } => {
                        check_reg(dst)?;
                        let target = self
                            .functions
                            .get(callee.0 as usize)
                            .ok_or(CodeError::BadCallee { func: fid, callee: callee.0 })?;
                        // Widened so adversarial base/nargs cannot wrap past
                        // the register file.
                        if base.0 as u32 + nargs as u32 > nregs as u32
                            || nargs != target.arity
                        {
                            return Err(CodeError::BadRegister {
                                func: fid,
                                reg: base.0.saturating_add(nargs),
                                num_regs: nregs,
                            });
                        }
                    }
                    Instr::Return { src } => check_reg(src)?,
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Function Builder
// =============================================================================

/// A forward-patching label handed out by `FunctionBuilder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Builds one `JitFunction`, patching branch targets at `finish`.
pub struct FunctionBuilder {
    name: String,
    arity: u16,
    num_regs: u16,
    consts: Vec<Value>,
    code: Vec<Instr>,
    labels: Vec<Option<u32>>,
    effect: CallEffect,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, arity: u16, num_regs: u16) -> Self {
        FunctionBuilder {
            name: name.into(),
            arity,
            num_regs,
            consts: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
            effect: CallEffect::Opaque,
        }
    }

    pub fn effect(mut self, effect: CallEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Intern a constant, deduplicating.
    pub fn constant(&mut self, value: Value) -> u16 {
        if let Some(i) = self.consts.iter().position(|c| *c == value) {
            return i as u16;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u16
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the next instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    pub fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    pub fn load_const(&mut self, dst: Reg, value: Value) {
        let index = self.constant(value);
        self.emit(Instr::LoadConst { dst, index });
    }

    pub fn binary(&mut self, op: BinOp, dst: Reg, lhs: Reg, rhs: Reg) {
        self.emit(Instr::Binary { op, dst, lhs, rhs });
    }

    pub fn unary(&mut self, op: UnOp, dst: Reg, src: Reg) {
        self.emit(Instr::Unary { op, dst, src });
    }

    // Branch targets use the label index until `finish` patches them.
    pub fn jump(&mut self, label: Label) {
        self.emit(Instr::Jump { target: label.0 });
    }

    pub fn jump_if_true(&mut self, cond: Reg, label: Label) {
        self.emit(Instr::JumpIfTrue { cond, target: label.0 });
    }

    pub fn jump_if_false(&mut self, cond: Reg, label: Label) {
        self.emit(Instr::JumpIfFalse { cond, target: label.0 });
    }

    pub fn loop_header(&mut self, site: SiteId) {
        self.emit(Instr::LoopHeader { site });
    }

    pub fn call(&mut self, dst: Reg, func: FuncId, base: Reg, nargs: u16) {
        self.emit(Instr::Call { dst, func, base, nargs });
    }

    pub fn ret(&mut self, src: Reg) {
        self.emit(Instr::Return { src });
    }

    /// Patch labels and produce the function.
    pub fn finish(self) -> Result<JitFunction, CodeError> {
        let FunctionBuilder {
            name,
            arity,
            num_regs,
            consts,
            mut code,
            labels,
            effect,
        } = self;
        let resolve = |label: u32| -> Result<u32, CodeError> {
            labels
                .get(label as usize)
                .copied()
                .flatten()
                .ok_or(CodeError::UnboundLabel { label })
        };
        for instr in &mut code {
            match instr {
                Instr::Jump { target }
                | Instr::JumpIfTrue { target, .. }
                | Instr::JumpIfFalse { target, .. } => *target = resolve(*target)?,
                _ => {}
            }
        }
        Ok(JitFunction {
            name,
            arity,
            num_regs,
            consts,
            code,
            effect,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_patches_labels() {
        let mut b = FunctionBuilder::new("spin", 1, 2);
        let top = b.new_label();
        let done = b.new_label();
        b.bind(top);
        b.jump_if_false(Reg(0), done);
        b.load_const(Reg(1), Value::Int(1));
        b.binary(BinOp::IntSub, Reg(0), Reg(0), Reg(1));
        b.jump(top);
        b.bind(done);
        b.ret(Reg(0));
        let func = b.finish().unwrap();

        assert_eq!(func.code[0], Instr::JumpIfFalse { cond: Reg(0), target: 4 });
        assert_eq!(func.code[3], Instr::Jump { target: 0 });
    }

    #[test]
    fn builder_dedups_constants() {
        let mut b = FunctionBuilder::new("k", 0, 1);
        let a = b.constant(Value::Int(5));
        let c = b.constant(Value::Int(5));
        let d = b.constant(Value::Int(6));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = FunctionBuilder::new("bad", 0, 1);
        let l = b.new_label();
        b.jump(l);
        assert!(matches!(b.finish(), Err(CodeError::UnboundLabel { .. })));
    }

    #[test]
    fn validate_rejects_bad_register() {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("f", 0, 1);
        b.emit(Instr::Move { dst: Reg(3), src: Reg(0) });
        b.ret(Reg(0));
        program.add_function(b.finish().unwrap());
        assert!(matches!(
            program.validate(),
            Err(CodeError::BadRegister { reg: 3, .. })
        ));
    }

    #[test]
    fn validate_rejects_wrapping_call_window() {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("callee", 2, 3);
        b.ret(Reg(0));
        let callee = program.add_function(b.finish().unwrap());

        // base + nargs wraps u16 to 1, which would slip past a narrow check.
        let mut b = FunctionBuilder::new("f", 0, 4);
        b.emit(Instr::Call { dst: Reg(0), func: callee, base: Reg(u16::MAX), nargs: 2 });
        b.ret(Reg(0));
        program.add_function(b.finish().unwrap());
        assert!(matches!(
            program.validate(),
            Err(CodeError::BadRegister { .. })
        ));
    }

    #[test]
    fn validate_rejects_falling_off_the_end() {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("f", 0, 1);
        b.emit(Instr::Move { dst: Reg(0), src: Reg(0) });
        program.add_function(b.finish().unwrap());
        assert!(matches!(
            program.validate(),
            Err(CodeError::MissingReturn { .. })
        ));
    }

    #[test]
    fn validate_accepts_well_formed_loop() {
        let mut program = Program::new();
        let site = program.add_site(LoopSite {
            greens: vec![],
            reds: vec![Reg(0)],
        });
        let mut b = FunctionBuilder::new("f", 1, 2);
        let top = b.new_label();
        let done = b.new_label();
        b.bind(top);
        b.loop_header(site);
        b.jump_if_false(Reg(0), done);
        b.load_const(Reg(1), Value::Int(1));
        b.binary(BinOp::IntSub, Reg(0), Reg(0), Reg(1));
        b.jump(top);
        b.bind(done);
        b.ret(Reg(0));
        program.add_function(b.finish().unwrap());
        program.validate().unwrap();
    }
}
