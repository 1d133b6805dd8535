//! Bytecode to machine code translation.
//!
//! The translator walks a method once, simulating the operand stack with
//! [`WorkingStack`] so that most values never touch memory. At every block
//! boundary (labels, jumps and conditional branches) the working stack is
//! flushed onto the VM operand stack; a pop from an empty working stack
//! therefore loads the value back from the operand stack at run time. The
//! parameter prelude of a method is translated the same way.

use serde::Serialize;
use tracing::trace;

use super::bridge::{self, CallbackOp};
use super::codebuf::{Assembly, Constant, ErrorKind, FixupKind, Label};
use super::emitter::{Base, Cond, Emitter, FOperand, FReg, FloatOp, IntOp, Operand, Reg, Width};
use super::error::CompileError;
use super::frame::{FrameLayout, slots};
use super::regalloc::{RegClass, RegisterAllocator, RegisterHandle};
use super::stack::{FrameSlot, ValueDescriptor, WorkingStack};
use crate::vm::runtime::{float_arith, float_to_int, int_arith};
use crate::vm::{ElementKind, JumpCond, MemoryContext, Method, Op, Program, ReturnType, fatal};

/// Counters describing the shape of the generated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodegenStats {
    /// Conditional branches emitted for control flow.
    pub cond_branches: usize,
    /// Comparisons whose result was materialized as 0/1.
    pub materialized_bools: usize,
    /// Nil, bounds, shape and operand stack checks.
    pub checks: usize,
    pub callbacks: usize,
    /// Registers saved around bridge calls.
    pub spills: usize,
}

/// Output of one method translation.
pub struct Translation {
    pub assembly: Assembly,
    pub stats: CodegenStats,
    /// Every register handle went back to its pool.
    pub pools_returned: bool,
}

pub struct Translator<'a, E: Emitter> {
    program: &'a Program,
    method: &'a Method,
    emitter: E,
    regs: RegisterAllocator,
    stack: WorkingStack,
    frame: FrameLayout,
    stats: CodegenStats,
    dispatcher: usize,
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

fn element_width(kind: ElementKind) -> Width {
    match kind {
        ElementKind::Byte => Width::Byte,
        ElementKind::Char => Width::Char,
        ElementKind::Int | ElementKind::Float => Width::Word,
    }
}

fn int_cond(op: &Op) -> Option<Cond> {
    Some(match op {
        Op::LesInt | Op::LesFloat => Cond::Lt,
        Op::GtrInt | Op::GtrFloat => Cond::Gt,
        Op::LesEqlInt | Op::LesEqlFloat => Cond::Le,
        Op::GtrEqlInt | Op::GtrEqlFloat => Cond::Ge,
        Op::EqlInt | Op::EqlFloat => Cond::Eq,
        Op::NeqlInt | Op::NeqlFloat => Cond::Ne,
        _ => return None,
    })
}

impl<'a, E: Emitter> Translator<'a, E> {
    pub fn new(program: &'a Program, method: &'a Method) -> Result<Self, CompileError> {
        let frame = FrameLayout::build(method, E::PRIMARY.len() + E::FLOATS.len())?;
        Ok(Self {
            program,
            method,
            emitter: E::new(),
            regs: RegisterAllocator::for_emitter::<E>(),
            stack: WorkingStack::new(),
            frame,
            stats: CodegenStats::default(),
            dispatcher: bridge::dispatcher_address(),
        })
    }

    pub fn translate(mut self) -> Result<Translation, CompileError> {
        self.emitter.prologue(&self.frame);

        let mut ip = 0;
        while ip < self.method.code.len() {
            ip += self.translate_op(ip);
        }

        // falling off the end returns normally
        self.flush_all();
        self.emitter.epilogue(0);
        for kind in ErrorKind::ALL {
            self.emitter.buffer_mut().define_trap(kind);
            self.emitter.epilogue(kind.sentinel());
        }

        if self.regs.is_exhausted() {
            return Err(CompileError::RegistersExhausted);
        }
        let pools_returned = self.regs.all_free();
        let assembly = self.emitter.into_buffer().resolve::<E>()?;
        Ok(Translation {
            assembly,
            stats: self.stats,
            pools_returned,
        })
    }

    /// Translate the instruction at `ip`; returns how many were consumed.
    fn translate_op(&mut self, ip: usize) -> usize {
        let method = self.method;
        let op = &method.code[ip];
        trace!(target: "stackjit::jit", ip, op = op.name(), depth = self.stack.len(), "translate");

        match op {
            Op::LoadIntLit { value } => self.stack.push(ValueDescriptor::ImmInt(*value)),
            Op::LoadFloatLit { value } => self.stack.push(ValueDescriptor::ImmFloat(*value)),
            Op::LoadInstMem => self.stack.push(ValueDescriptor::Mem(FrameSlot {
                offset: slots::INSTANCE_MEM,
                class: RegClass::General,
            })),
            Op::LoadClsMem => self.stack.push(ValueDescriptor::Mem(FrameSlot {
                offset: slots::CLASS_MEM,
                class: RegClass::General,
            })),

            Op::LoadIntVar { id, ctx } => self.load_var(*id, *ctx, RegClass::General),
            Op::LoadFloatVar { id, ctx } => self.load_var(*id, *ctx, RegClass::Float),
            Op::StorIntVar { id, ctx } => self.store_var(*id, *ctx, RegClass::General, false),
            Op::StorFloatVar { id, ctx } => self.store_var(*id, *ctx, RegClass::Float, false),
            Op::CopyIntVar { id, ctx } => self.store_var(*id, *ctx, RegClass::General, true),
            Op::CopyFloatVar { id, ctx } => self.store_var(*id, *ctx, RegClass::Float, true),

            Op::AddInt => self.int_binary(op, IntOp::Add),
            Op::SubInt => self.int_binary(op, IntOp::Sub),
            Op::MulInt => self.int_binary(op, IntOp::Mul),
            Op::BitAndInt => self.int_binary(op, IntOp::And),
            Op::BitOrInt => self.int_binary(op, IntOp::Or),
            Op::BitXorInt => self.int_binary(op, IntOp::Xor),
            Op::ShlInt => self.int_binary(op, IntOp::Shl),
            Op::ShrInt => self.int_binary(op, IntOp::Shr),
            Op::DivInt => self.int_divide(op, false),
            Op::ModInt => self.int_divide(op, true),
            Op::LesInt | Op::GtrInt | Op::LesEqlInt | Op::GtrEqlInt | Op::EqlInt | Op::NeqlInt => {
                return self.int_compare(ip, op);
            }

            Op::AddFloat => self.float_binary(op, FloatOp::Add),
            Op::SubFloat => self.float_binary(op, FloatOp::Sub),
            Op::MulFloat => self.float_binary(op, FloatOp::Mul),
            Op::DivFloat => self.float_binary(op, FloatOp::Div),
            Op::LesFloat
            | Op::GtrFloat
            | Op::LesEqlFloat
            | Op::GtrEqlFloat
            | Op::EqlFloat
            | Op::NeqlFloat => return self.float_compare(ip, op),

            Op::I2F => self.int_to_float(),
            Op::F2I => self.float_to_int(),

            Op::PopInt => {
                let value = self.pop(RegClass::General);
                self.release_value(value);
            }
            Op::PopFloat => {
                let value = self.pop(RegClass::Float);
                self.release_value(value);
            }
            Op::SwapInt => {
                let top = self.pop(RegClass::General);
                let below = self.pop(RegClass::General);
                self.stack.push(top);
                self.stack.push(below);
            }

            Op::Lbl { id } => {
                self.flush_all();
                self.emitter.buffer_mut().define_label(Label::Bytecode(*id));
            }
            Op::Jmp { label, cond } => self.jump(*label, *cond),
            Op::Rtrn => {
                self.flush_all();
                self.emitter.epilogue(0);
            }

            Op::LoadAryElm { kind, dims } => self.load_array_element(*kind, *dims),
            Op::StorAryElm { kind, dims } => self.store_array_element(*kind, *dims),

            _ => match self.callback_shape(op) {
                Some((callback, params, rtrn)) => self.callback(ip, callback, params, rtrn),
                None => fatal(format!(
                    "no translation for '{}' in {}",
                    op.name(),
                    method.full_name
                )),
            },
        }
        1
    }

    /// Bridge operation, argument count and result class of a bridged
    /// instruction.
    fn callback_shape(&self, op: &Op) -> Option<(CallbackOp, usize, ReturnType)> {
        let callback = CallbackOp::of(op)?;
        let (params, rtrn) = match *op {
            Op::MthdCall { cls, mthd } => {
                let Some(callee) = self.program.method(cls, mthd) else {
                    fatal(format!(
                        "call to unknown method {cls}:{mthd} in {}",
                        self.method.full_name
                    ));
                };
                (callee.params + 1, callee.rtrn)
            }
            Op::DynMthdCall { params, rtrn } => (params + 2, rtrn),
            Op::AsyncMthdCall { .. } => (1, ReturnType::Nil),
            Op::NewAry { dims, .. } => (dims, ReturnType::Int),
            Op::NewObjInst { .. } => (0, ReturnType::Int),
            Op::LoadArySize => (1, ReturnType::Int),
            Op::CpyAry { .. } => (5, ReturnType::Int),
            Op::ZeroAry { .. } => (1, ReturnType::Nil),
            Op::I2S => (3, ReturnType::Nil),
            Op::F2S => (2, ReturnType::Nil),
            Op::S2I => (2, ReturnType::Int),
            Op::S2F => (1, ReturnType::Float),
            Op::ObjTypeOf { .. } | Op::ObjInstCast { .. } => (1, ReturnType::Int),
            Op::ThreadJoin | Op::ThreadMutex => (0, ReturnType::Nil),
            Op::ThreadSleep | Op::CriticalStart | Op::CriticalEnd => (1, ReturnType::Nil),
            Op::RandFloat => (0, ReturnType::Float),
            Op::Trap { args } => (args, ReturnType::Nil),
            Op::TrapRtrn { args } => (args, ReturnType::Int),
            _ => return None,
        };
        Some((callback, params, rtrn))
    }

    // ==================== Working stack helpers ====================

    fn pop(&mut self, class: RegClass) -> ValueDescriptor {
        if let Some(value) = self.stack.pop() {
            return value;
        }
        // flushed at a block boundary or passed by the caller
        let handle = self.regs.acquire_class(class);
        match class {
            RegClass::General => self.stack_pop(handle.reg()),
            RegClass::Float => self.stack_pop_float(handle.freg()),
        }
        ValueDescriptor::Reg(handle)
    }

    fn release(&mut self, handle: Option<RegisterHandle>) {
        if let Some(handle) = handle {
            self.regs.release(handle);
        }
    }

    fn release_value(&mut self, value: ValueDescriptor) {
        if let ValueDescriptor::Reg(handle) = value {
            self.regs.release(handle);
        }
    }

    fn load_imm(&mut self, dst: Reg, value: i64) {
        if fits_i32(value) {
            self.emitter.mov_imm(dst, value as i32);
        } else {
            let anchor = self.emitter.load_const(dst);
            self.emitter
                .buffer_mut()
                .add_fixup(anchor, FixupKind::Constant(Constant::Int(value)));
        }
    }

    /// An owned general register holding `value`.
    fn int_reg(&mut self, value: ValueDescriptor) -> RegisterHandle {
        match value {
            ValueDescriptor::Reg(handle) if !handle.is_float() => handle,
            ValueDescriptor::ImmInt(v) => {
                let handle = self.regs.acquire();
                self.load_imm(handle.reg(), v);
                handle
            }
            ValueDescriptor::Mem(slot) if slot.class == RegClass::General => {
                let handle = self.regs.acquire();
                self.emitter
                    .load(handle.reg(), Base::Frame, slot.offset, Width::Word);
                handle
            }
            _ => fatal(format!(
                "integer operand expected in {}",
                self.method.full_name
            )),
        }
    }

    /// An integer source operand plus the register to release afterwards.
    fn int_operand(&mut self, value: ValueDescriptor) -> (Operand, Option<RegisterHandle>) {
        match value {
            ValueDescriptor::ImmInt(v) if fits_i32(v) => (Operand::Imm(v as i32), None),
            ValueDescriptor::Mem(slot) if slot.class == RegClass::General => {
                (Operand::Mem(Base::Frame, slot.offset), None)
            }
            other => {
                let handle = self.int_reg(other);
                (Operand::Reg(handle.reg()), Some(handle))
            }
        }
    }

    fn float_reg(&mut self, value: ValueDescriptor) -> RegisterHandle {
        match value {
            ValueDescriptor::Reg(handle) if handle.is_float() => handle,
            ValueDescriptor::ImmFloat(v) => {
                let handle = self.regs.acquire_float();
                let anchor = self.emitter.load_float_const(handle.freg());
                self.emitter
                    .buffer_mut()
                    .add_fixup(anchor, FixupKind::Constant(Constant::Float(v)));
                handle
            }
            ValueDescriptor::Mem(slot) if slot.class == RegClass::Float => {
                let handle = self.regs.acquire_float();
                self.emitter
                    .load_float(handle.freg(), Base::Frame, slot.offset);
                handle
            }
            _ => fatal(format!("float operand expected in {}", self.method.full_name)),
        }
    }

    fn float_operand(&mut self, value: ValueDescriptor) -> (FOperand, Option<RegisterHandle>) {
        match value {
            ValueDescriptor::Mem(slot) if slot.class == RegClass::Float => {
                (FOperand::Mem(Base::Frame, slot.offset), None)
            }
            other => {
                let handle = self.float_reg(other);
                (FOperand::Reg(handle.freg()), Some(handle))
            }
        }
    }

    /// Push one descriptor onto the VM operand stack.
    fn flush_value(&mut self, value: ValueDescriptor) {
        match value {
            ValueDescriptor::ImmInt(v) if fits_i32(v) => {
                self.stack_push(Operand::Imm(v as i32));
            }
            ValueDescriptor::ImmInt(v) => {
                let handle = self.int_reg(ValueDescriptor::ImmInt(v));
                self.stack_push(Operand::Reg(handle.reg()));
                self.regs.release(handle);
            }
            ValueDescriptor::ImmFloat(v) => {
                self.flush_value(ValueDescriptor::ImmInt(v.to_bits() as i64));
            }
            ValueDescriptor::Reg(handle) => {
                if handle.is_float() {
                    self.stack_push_float(handle.freg());
                } else {
                    self.stack_push(Operand::Reg(handle.reg()));
                }
                self.regs.release(handle);
            }
            // both classes are copied as raw words
            ValueDescriptor::Mem(slot) => {
                self.stack_push(Operand::Mem(Base::Frame, slot.offset));
            }
        }
    }

    /// Move the whole working stack onto the VM operand stack, bottom first.
    fn flush_all(&mut self) {
        let values = self.stack.split_top(self.stack.len());
        for value in values {
            self.flush_value(value);
        }
    }

    /// Load every deferred read of the local at `offset` before it changes.
    fn materialize_slot(&mut self, offset: i32) {
        for index in self.stack.slot_users(offset) {
            let class = match self.stack.get(index) {
                Some(value) => value.class(),
                None => continue,
            };
            let handle = self.regs.acquire_class(class);
            match class {
                RegClass::General => {
                    self.emitter
                        .load(handle.reg(), Base::Frame, offset, Width::Word)
                }
                RegClass::Float => self.emitter.load_float(handle.freg(), Base::Frame, offset),
            }
            self.stack.replace(index, ValueDescriptor::Reg(handle));
        }
    }

    fn error_branch(&mut self, cond: Cond, kind: ErrorKind) {
        let anchor = self.emitter.branch(cond);
        self.error_fixup(anchor, kind);
    }

    fn error_fixup(&mut self, anchor: usize, kind: ErrorKind) {
        self.emitter
            .buffer_mut()
            .add_fixup(anchor, FixupKind::ErrorBranch(kind));
        self.stats.checks += 1;
    }

    fn stack_push(&mut self, src: Operand) {
        let full = self.emitter.op_stack_push(src);
        self.error_fixup(full, ErrorKind::StackOverflow);
    }

    fn stack_push_float(&mut self, src: FReg) {
        let full = self.emitter.op_stack_push_float(src);
        self.error_fixup(full, ErrorKind::StackOverflow);
    }

    fn stack_pop(&mut self, dst: Reg) {
        let empty = self.emitter.op_stack_pop(dst);
        self.error_fixup(empty, ErrorKind::StackUnderflow);
    }

    fn stack_pop_float(&mut self, dst: FReg) {
        let empty = self.emitter.op_stack_pop_float(dst);
        self.error_fixup(empty, ErrorKind::StackUnderflow);
    }

    /// Header word 1 must match the instruction's dimension count, so the
    /// extents and data are read at the offsets the header describes.
    fn shape_check(&mut self, array: Reg, dims: usize) {
        let stored = self.regs.acquire();
        self.emitter
            .load(stored.reg(), Base::Reg(array), 8, Width::Word);
        self.emitter.cmp(stored.reg(), Operand::Imm(dims as i32));
        self.error_branch(Cond::Ne, ErrorKind::ShapeMismatch);
        self.regs.release(stored);
    }

    fn nil_check(&mut self, reg: Reg) {
        self.emitter.cmp(reg, Operand::Imm(0));
        self.error_branch(Cond::Eq, ErrorKind::NilDeref);
    }

    fn jump_to(&mut self, label: Label) {
        let anchor = self.emitter.jump();
        self.emitter
            .buffer_mut()
            .add_fixup(anchor, FixupKind::Jump(label));
    }

    fn branch_to(&mut self, cond: Cond, label: Label) {
        let anchor = self.emitter.branch(cond);
        self.emitter
            .buffer_mut()
            .add_fixup(anchor, FixupKind::Jump(label));
        self.stats.cond_branches += 1;
    }

    fn local_slot(&self, id: i64) -> i32 {
        match self.frame.local(id) {
            Some(offset) => offset,
            None => fatal(format!(
                "local {id} has no frame slot in {}",
                self.method.full_name
            )),
        }
    }

    /// The conditional `Jmp` directly after `ip`, as (label, jump-if-true).
    fn fused_jump(&self, ip: usize) -> Option<(i64, bool)> {
        match self.method.code.get(ip + 1) {
            Some(Op::Jmp { label, cond: JumpCond::IfTrue }) => Some((*label, true)),
            Some(Op::Jmp { label, cond: JumpCond::IfFalse }) => Some((*label, false)),
            _ => None,
        }
    }

    // ==================== Variables ====================

    fn load_var(&mut self, id: i64, ctx: MemoryContext, class: RegClass) {
        if ctx == MemoryContext::Local {
            let offset = self.local_slot(id);
            self.stack
                .push(ValueDescriptor::Mem(FrameSlot { offset, class }));
            return;
        }

        let object = self.pop(RegClass::General);
        let object = self.int_reg(object);
        self.nil_check(object.reg());
        let disp = FrameLayout::member(id);
        match class {
            RegClass::General => {
                self.emitter
                    .load(object.reg(), Base::Reg(object.reg()), disp, Width::Word);
                self.stack.push(ValueDescriptor::Reg(object));
            }
            RegClass::Float => {
                let value = self.regs.acquire_float();
                self.emitter
                    .load_float(value.freg(), Base::Reg(object.reg()), disp);
                self.regs.release(object);
                self.stack.push(ValueDescriptor::Reg(value));
            }
        }
    }

    fn store_var(&mut self, id: i64, ctx: MemoryContext, class: RegClass, keep: bool) {
        let (base, disp, object) = match ctx {
            MemoryContext::Local => {
                let offset = self.local_slot(id);
                self.materialize_slot(offset);
                (Base::Frame, offset, None)
            }
            MemoryContext::Instance | MemoryContext::Class => {
                let object = self.pop(RegClass::General);
                let object = self.int_reg(object);
                self.nil_check(object.reg());
                (Base::Reg(object.reg()), FrameLayout::member(id), Some(object))
            }
        };

        let value = self.pop(class);
        let kept = match (class, value) {
            (RegClass::General, ValueDescriptor::ImmInt(v)) if fits_i32(v) => {
                self.emitter.store_imm(v as i32, base, disp, Width::Word);
                ValueDescriptor::ImmInt(v)
            }
            (RegClass::General, value) => {
                let handle = self.int_reg(value);
                self.emitter.store(handle.reg(), base, disp, Width::Word);
                ValueDescriptor::Reg(handle)
            }
            (RegClass::Float, value) => {
                let handle = self.float_reg(value);
                self.emitter.store_float(handle.freg(), base, disp);
                ValueDescriptor::Reg(handle)
            }
        };

        self.release(object);
        if keep {
            self.stack.push(kept);
        } else {
            self.release_value(kept);
        }
    }

    // ==================== Arithmetic ====================

    fn int_binary(&mut self, op: &Op, kind: IntOp) {
        let right = self.pop(RegClass::General);
        let left = self.pop(RegClass::General);
        if let (ValueDescriptor::ImmInt(l), ValueDescriptor::ImmInt(r)) = (&left, &right) {
            if let Some(v) = int_arith(op, *l, *r) {
                self.stack.push(ValueDescriptor::ImmInt(v));
                return;
            }
        }

        let commutative = matches!(
            kind,
            IntOp::Add | IntOp::Mul | IntOp::And | IntOp::Or | IntOp::Xor
        );
        let (left, right) = match (left, right) {
            (l, ValueDescriptor::Reg(r)) if commutative && !matches!(l, ValueDescriptor::Reg(_)) => {
                (ValueDescriptor::Reg(r), l)
            }
            pair => pair,
        };

        let dst = self.int_reg(left);
        let (src, temp) = self.int_operand(right);
        self.emitter.int_op(kind, dst.reg(), src);
        self.release(temp);
        self.stack.push(ValueDescriptor::Reg(dst));
    }

    fn int_divide(&mut self, op: &Op, modulo: bool) {
        let right = self.pop(RegClass::General);
        let left = self.pop(RegClass::General);
        if let (ValueDescriptor::ImmInt(l), ValueDescriptor::ImmInt(r)) = (&left, &right) {
            // a constant zero divisor is left to trap at run time
            if let Some(v) = int_arith(op, *l, *r) {
                self.stack.push(ValueDescriptor::ImmInt(v));
                return;
            }
        }

        let nonzero = matches!(right, ValueDescriptor::ImmInt(v) if v != 0);
        let divisor = self.int_reg(right);
        if !nonzero {
            self.emitter.cmp(divisor.reg(), Operand::Imm(0));
            self.error_branch(Cond::Eq, ErrorKind::DivideByZero);
        }
        let dst = self.int_reg(left);
        self.emitter.div(dst.reg(), divisor.reg(), modulo);
        self.regs.release(divisor);
        self.stack.push(ValueDescriptor::Reg(dst));
    }

    fn int_compare(&mut self, ip: usize, op: &Op) -> usize {
        let Some(cond) = int_cond(op) else {
            return 1;
        };
        let right = self.pop(RegClass::General);
        let left = self.pop(RegClass::General);
        let fused = self.fused_jump(ip);

        if let (ValueDescriptor::ImmInt(l), ValueDescriptor::ImmInt(r)) = (&left, &right) {
            let holds = cond.holds_int(*l, *r);
            return self.static_branch(holds, fused);
        }

        if let Some((label, if_true)) = fused {
            self.flush_all();
            let lhs = self.int_reg(left);
            let (rhs, temp) = self.int_operand(right);
            self.emitter.cmp(lhs.reg(), rhs);
            self.release(temp);
            self.regs.release(lhs);
            let cond = if if_true { cond } else { cond.negate() };
            self.branch_to(cond, Label::Bytecode(label));
            return 2;
        }

        let lhs = self.int_reg(left);
        let (rhs, temp) = self.int_operand(right);
        self.emitter.cmp(lhs.reg(), rhs);
        self.release(temp);
        self.emitter.set_cond(cond, lhs.reg());
        self.stats.materialized_bools += 1;
        self.stack.push(ValueDescriptor::Reg(lhs));
        1
    }

    /// A comparison decided at compile time.
    fn static_branch(&mut self, holds: bool, fused: Option<(i64, bool)>) -> usize {
        match fused {
            Some((label, if_true)) => {
                if holds == if_true {
                    self.flush_all();
                    self.jump_to(Label::Bytecode(label));
                }
                2
            }
            None => {
                self.stack.push(ValueDescriptor::ImmInt(holds as i64));
                1
            }
        }
    }

    fn float_binary(&mut self, op: &Op, kind: FloatOp) {
        let right = self.pop(RegClass::Float);
        let left = self.pop(RegClass::Float);
        if let (ValueDescriptor::ImmFloat(l), ValueDescriptor::ImmFloat(r)) = (&left, &right) {
            if let Some(v) = float_arith(op, *l, *r) {
                self.stack.push(ValueDescriptor::ImmFloat(v));
                return;
            }
        }

        let commutative = matches!(kind, FloatOp::Add | FloatOp::Mul);
        let (left, right) = match (left, right) {
            (l, ValueDescriptor::Reg(r)) if commutative && !matches!(l, ValueDescriptor::Reg(_)) => {
                (ValueDescriptor::Reg(r), l)
            }
            pair => pair,
        };

        let dst = self.float_reg(left);
        let (src, temp) = self.float_operand(right);
        self.emitter.float_op(kind, dst.freg(), src);
        self.release(temp);
        self.stack.push(ValueDescriptor::Reg(dst));
    }

    fn float_compare(&mut self, ip: usize, op: &Op) -> usize {
        let Some(cond) = int_cond(op) else {
            return 1;
        };
        let right = self.pop(RegClass::Float);
        let left = self.pop(RegClass::Float);
        let fused = self.fused_jump(ip);

        if let (ValueDescriptor::ImmFloat(l), ValueDescriptor::ImmFloat(r)) = (&left, &right) {
            let holds = cond.holds_float(*l, *r);
            return self.static_branch(holds, fused);
        }

        if let Some((label, if_true)) = fused {
            self.flush_all();
            let lhs = self.float_reg(left);
            let rhs = self.float_reg(right);
            let anchors = self
                .emitter
                .float_branch(cond, !if_true, lhs.freg(), rhs.freg());
            for anchor in anchors {
                self.emitter
                    .buffer_mut()
                    .add_fixup(anchor, FixupKind::Jump(Label::Bytecode(label)));
            }
            self.stats.cond_branches += 1;
            self.regs.release(lhs);
            self.regs.release(rhs);
            return 2;
        }

        let lhs = self.float_reg(left);
        let rhs = self.float_reg(right);
        let dst = self.regs.acquire();
        self.emitter.float_set(cond, lhs.freg(), rhs.freg(), dst.reg());
        self.regs.release(lhs);
        self.regs.release(rhs);
        self.stats.materialized_bools += 1;
        self.stack.push(ValueDescriptor::Reg(dst));
        1
    }

    fn int_to_float(&mut self) {
        match self.pop(RegClass::General) {
            ValueDescriptor::ImmInt(v) => self.stack.push(ValueDescriptor::ImmFloat(v as f64)),
            value => {
                let src = self.int_reg(value);
                let dst = self.regs.acquire_float();
                self.emitter.int_to_float(dst.freg(), src.reg());
                self.regs.release(src);
                self.stack.push(ValueDescriptor::Reg(dst));
            }
        }
    }

    fn float_to_int(&mut self) {
        match self.pop(RegClass::Float) {
            ValueDescriptor::ImmFloat(v) => {
                self.stack.push(ValueDescriptor::ImmInt(float_to_int(v)))
            }
            value => {
                let src = self.float_reg(value);
                let dst = self.regs.acquire();
                self.emitter.float_to_int(dst.reg(), src.freg());
                self.regs.release(src);
                self.stack.push(ValueDescriptor::Reg(dst));
            }
        }
    }

    // ==================== Control flow ====================

    fn jump(&mut self, label: i64, cond: JumpCond) {
        let if_true = match cond {
            JumpCond::Always => {
                self.flush_all();
                self.jump_to(Label::Bytecode(label));
                return;
            }
            JumpCond::IfTrue => true,
            JumpCond::IfFalse => false,
        };

        match self.pop(RegClass::General) {
            ValueDescriptor::ImmInt(v) => {
                if (v != 0) == if_true {
                    self.flush_all();
                    self.jump_to(Label::Bytecode(label));
                }
            }
            value => {
                self.flush_all();
                let flag = self.int_reg(value);
                self.emitter.cmp(flag.reg(), Operand::Imm(0));
                self.regs.release(flag);
                let cond = if if_true { Cond::Ne } else { Cond::Eq };
                self.branch_to(cond, Label::Bytecode(label));
            }
        }
    }

    // ==================== Arrays ====================

    /// Pop an array and its indices; returns (array, element address
    /// register). The element lives at `[address + (dims + 2) * 8]`.
    fn element_address(&mut self, kind: ElementKind, dims: usize) -> (RegisterHandle, RegisterHandle) {
        let array = self.pop(RegClass::General);
        let array = self.int_reg(array);
        self.nil_check(array.reg());
        self.shape_check(array.reg(), dims);

        let first = self.pop(RegClass::General);
        let index = self.int_reg(first);
        for dim in 1..dims {
            let extent = ((2 + dim) * 8) as i32;
            self.emitter
                .int_op(IntOp::Mul, index.reg(), Operand::Mem(Base::Reg(array.reg()), extent));
            let next = self.pop(RegClass::General);
            let (next, temp) = self.int_operand(next);
            self.emitter.int_op(IntOp::Add, index.reg(), next);
            self.release(temp);
        }

        self.emitter.cmp(index.reg(), Operand::Imm(0));
        self.error_branch(Cond::Lt, ErrorKind::ArrayUnderflow);
        self.emitter
            .cmp(index.reg(), Operand::Mem(Base::Reg(array.reg()), 0));
        self.error_branch(Cond::Ge, ErrorKind::ArrayOverflow);

        if kind.shift() > 0 {
            self.emitter
                .int_op(IntOp::Shl, index.reg(), Operand::Imm(kind.shift() as i32));
        }
        self.emitter
            .int_op(IntOp::Add, index.reg(), Operand::Reg(array.reg()));
        (array, index)
    }

    fn load_array_element(&mut self, kind: ElementKind, dims: usize) {
        let (array, address) = self.element_address(kind, dims);
        let disp = ((dims + 2) * 8) as i32;
        self.regs.release(array);
        if kind.is_float() {
            let value = self.regs.acquire_float();
            self.emitter
                .load_float(value.freg(), Base::Reg(address.reg()), disp);
            self.regs.release(address);
            self.stack.push(ValueDescriptor::Reg(value));
        } else {
            self.emitter.load(
                address.reg(),
                Base::Reg(address.reg()),
                disp,
                element_width(kind),
            );
            self.stack.push(ValueDescriptor::Reg(address));
        }
    }

    fn store_array_element(&mut self, kind: ElementKind, dims: usize) {
        let (array, address) = self.element_address(kind, dims);
        self.regs.release(array);
        let base = Base::Reg(address.reg());
        let disp = ((dims + 2) * 8) as i32;

        if kind.is_float() {
            let value = self.pop(RegClass::Float);
            let value = self.float_reg(value);
            self.emitter.store_float(value.freg(), base, disp);
            self.regs.release(value);
        } else {
            match self.pop(RegClass::General) {
                ValueDescriptor::ImmInt(v) if fits_i32(v) => {
                    self.emitter
                        .store_imm(v as i32, base, disp, element_width(kind));
                }
                value => {
                    let value = self.int_reg(value);
                    self.emitter
                        .store(value.reg(), base, disp, element_width(kind));
                    self.regs.release(value);
                }
            }
        }
        self.regs.release(address);
    }

    // ==================== Bridge calls ====================

    fn callback(&mut self, ip: usize, op: CallbackOp, params: usize, rtrn: ReturnType) {
        let args = self.stack.split_top(params);

        // caller-saved registers still live below the arguments
        let live: Vec<(RegClass, u8)> = self
            .stack
            .iter()
            .filter_map(|value| match value {
                ValueDescriptor::Reg(handle) if handle.is_caller_saved() => {
                    Some(match handle.class() {
                        RegClass::General => (RegClass::General, handle.reg().0),
                        RegClass::Float => (RegClass::Float, handle.freg().0),
                    })
                }
                _ => None,
            })
            .collect();
        for (i, (class, hw)) in live.iter().enumerate() {
            let offset = self.frame.spill_slot(i);
            match class {
                RegClass::General => self.emitter.store(Reg(*hw), Base::Frame, offset, Width::Word),
                RegClass::Float => self.emitter.store_float(FReg(*hw), Base::Frame, offset),
            }
        }

        for value in args {
            self.flush_value(value);
        }
        let instr = &self.method.code[ip] as *const Op as usize;
        self.emitter
            .call_dispatcher(self.dispatcher, op as i64, instr, ip as i64);

        for (i, (class, hw)) in live.iter().enumerate() {
            let offset = self.frame.spill_slot(i);
            match class {
                RegClass::General => self.emitter.load(Reg(*hw), Base::Frame, offset, Width::Word),
                RegClass::Float => self.emitter.load_float(FReg(*hw), Base::Frame, offset),
            }
        }
        self.stats.callbacks += 1;
        self.stats.spills += live.len();

        match rtrn {
            ReturnType::Nil => {}
            ReturnType::Int => {
                let result = self.regs.acquire();
                self.stack_pop(result.reg());
                self.stack.push(ValueDescriptor::Reg(result));
            }
            ReturnType::Float => {
                let result = self.regs.acquire_float();
                self.stack_pop_float(result.freg());
                self.stack.push(ValueDescriptor::Reg(result));
            }
        }
    }
}
