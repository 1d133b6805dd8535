//! The seam between the architecture-independent translator and the
//! per-architecture instruction encoders.
//!
//! The translator, register allocator, working stack and fixup resolution
//! never look at machine encodings; they drive an [`Emitter`]. Each target
//! implements the trait once on top of its assembler.

use super::codebuf::CodeBuffer;
use super::error::CompileError;
use super::frame::FrameLayout;

/// A general-purpose register, by hardware encoding number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

/// A floating-point register, by hardware encoding number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FReg(pub u8);

/// Base of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// The frame pointer of the compiled method.
    Frame,
    Reg(Reg),
}

/// Source operand of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i32),
    Reg(Reg),
    Mem(Base, i32),
}

/// Source operand of a float instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FOperand {
    Reg(FReg),
    Mem(Base, i32),
}

/// Memory access width. Loads zero-extend to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Char,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic shift right.
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Signed comparison outcome tested by a branch or set instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    pub fn negate(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
        }
    }

    pub fn holds_int(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => lhs < rhs,
            Cond::Le => lhs <= rhs,
            Cond::Gt => lhs > rhs,
            Cond::Ge => lhs >= rhs,
        }
    }

    /// IEEE semantics: every ordered comparison is false on NaN, `Ne` is true.
    pub fn holds_float(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => lhs < rhs,
            Cond::Le => lhs <= rhs,
            Cond::Gt => lhs > rhs,
            Cond::Ge => lhs >= rhs,
        }
    }
}

/// Instruction encoder for one target architecture.
///
/// Methods returning `usize` emit a placeholder and return its fixup anchor;
/// the caller records the fixup and [`Emitter::patch_branch`] or
/// [`Emitter::patch_constant`] fill it in during resolution. Scratch
/// registers used internally by an implementation are never part of the
/// allocatable pools.
pub trait Emitter {
    const NAME: &'static str;
    /// Caller-saved registers, allocated first.
    const PRIMARY: &'static [Reg];
    /// Callee-saved registers, used once the primary pool is empty.
    const AUXILIARY: &'static [Reg];
    const FLOATS: &'static [FReg];
    /// Register handed out by a fabricated handle after exhaustion.
    const FALLBACK: Reg;
    const FALLBACK_FLOAT: FReg;
    const MAX_CONSTANTS: usize;

    fn new() -> Self;
    fn buffer(&self) -> &CodeBuffer;
    fn buffer_mut(&mut self) -> &mut CodeBuffer;
    fn into_buffer(self) -> CodeBuffer;

    /// Build the frame, save callee-saved registers, spill the incoming
    /// arguments into the header slots and zero the local area.
    fn prologue(&mut self, frame: &FrameLayout);
    /// Return `status` to the caller, tearing the frame down.
    fn epilogue(&mut self, status: i64);

    fn mov_imm(&mut self, dst: Reg, imm: i32);
    /// Load a 64-bit pool constant.
    fn load_const(&mut self, dst: Reg) -> usize;
    fn load(&mut self, dst: Reg, base: Base, disp: i32, width: Width);
    fn store(&mut self, src: Reg, base: Base, disp: i32, width: Width);
    fn store_imm(&mut self, imm: i32, base: Base, disp: i32, width: Width);

    fn int_op(&mut self, op: IntOp, dst: Reg, src: Operand);
    /// Signed division. `src` is known to be non-zero; `MIN / -1` yields
    /// `MIN` and `MIN % -1` yields 0.
    fn div(&mut self, dst: Reg, src: Reg, modulo: bool);
    fn cmp(&mut self, lhs: Reg, rhs: Operand);
    /// Materialize the outcome of the last `cmp` as 0 or 1.
    fn set_cond(&mut self, cond: Cond, dst: Reg);
    fn branch(&mut self, cond: Cond) -> usize;
    fn jump(&mut self) -> usize;

    fn load_float(&mut self, dst: FReg, base: Base, disp: i32);
    fn store_float(&mut self, src: FReg, base: Base, disp: i32);
    fn load_float_const(&mut self, dst: FReg) -> usize;
    fn float_op(&mut self, op: FloatOp, dst: FReg, src: FOperand);
    /// Compare and branch when `cond` (or its negation) holds. May need more
    /// than one branch instruction, so every anchor is returned.
    fn float_branch(&mut self, cond: Cond, negate: bool, lhs: FReg, rhs: FReg) -> Vec<usize>;
    fn float_set(&mut self, cond: Cond, lhs: FReg, rhs: FReg, dst: Reg);
    fn int_to_float(&mut self, dst: FReg, src: Reg);
    /// Truncating conversion; NaN and out-of-range values give `i64::MIN`.
    fn float_to_int(&mut self, dst: Reg, src: FReg);

    /// Push onto the VM operand stack through the frame's stack pointers.
    /// Returns the anchor of the branch taken when the stack is full.
    fn op_stack_push(&mut self, src: Operand) -> usize;
    fn op_stack_push_float(&mut self, src: FReg) -> usize;
    /// Pop from the VM operand stack. Returns the anchor of the branch
    /// taken when the stack is empty.
    fn op_stack_pop(&mut self, dst: Reg) -> usize;
    fn op_stack_pop_float(&mut self, dst: FReg) -> usize;

    /// Call the bridge dispatcher with the fixed callback argument list.
    fn call_dispatcher(&mut self, target: usize, op_id: i64, instr: usize, ip: i64);

    fn patch_branch(code: &mut [u8], anchor: usize, target: usize) -> Result<(), CompileError>;
    fn patch_constant(code: &mut [u8], anchor: usize, slot: usize) -> Result<(), CompileError>;
}
