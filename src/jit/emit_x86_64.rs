//! [`Emitter`] for x86-64 (System V).
//!
//! Frame on entry (after the prologue):
//!
//! ```text
//!   [rbp + 24]  call_stack_pos     (7th and 8th native arguments)
//!   [rbp + 16]  call_stack
//!   [rbp + 8]   return address
//!   [rbp]       saved rbp
//!   [rbp - 8 .. rbp - 64]  header slots
//!   ...                    spill slots and locals
//!   [rbp - size - 32 ..]   saved rbx, r12, r13, r14
//! ```

use super::codebuf::{CodeBuffer, read_u32, write_u32};
use super::emitter::{
    Base, Cond, Emitter, FOperand, FReg, FloatOp, IntOp, Operand, Reg, Width,
};
use super::error::CompileError;
use super::frame::{FrameLayout, slots};
use super::x86_64::{self as x86, Mem, X86_64Assembler};

/// Callee-saved registers pushed by the prologue, in push order.
const SAVED: [x86::Reg; 4] = [x86::Reg::Rbx, x86::Reg::R12, x86::Reg::R13, x86::Reg::R14];

pub struct X86_64Emitter {
    buf: CodeBuffer,
    frame_size: i32,
}

fn hw(reg: Reg) -> x86::Reg {
    x86::Reg::from_u8(reg.0)
}

fn mem(base: Base, disp: i32) -> Mem {
    match base {
        Base::Frame => Mem::Base(x86::Reg::Rbp, disp),
        Base::Reg(reg) => Mem::Base(hw(reg), disp),
    }
}

fn int_cond(cond: Cond) -> x86::Cond {
    match cond {
        Cond::Eq => x86::Cond::E,
        Cond::Ne => x86::Cond::Ne,
        Cond::Lt => x86::Cond::L,
        Cond::Le => x86::Cond::Le,
        Cond::Gt => x86::Cond::G,
        Cond::Ge => x86::Cond::Ge,
    }
}

/// (opcode of the `r/m64, r64` form, ModR/M digit of the immediate form)
fn alu_codes(op: IntOp) -> Option<(u8, u8)> {
    match op {
        IntOp::Add => Some((0x01, 0)),
        IntOp::Or => Some((0x09, 1)),
        IntOp::And => Some((0x21, 4)),
        IntOp::Sub => Some((0x29, 5)),
        IntOp::Xor => Some((0x31, 6)),
        IntOp::Mul | IntOp::Shl | IntOp::Shr => None,
    }
}

/// ucomisd operand order and the unsigned condition testing it.
///
/// `ucomisd a, b` sets CF when `a < b` or unordered, ZF when `a == b` or
/// unordered. `A`/`AE` are therefore false on NaN and `B`/`BE` true.
fn float_cmp(cond: Cond, negate: bool) -> (bool, x86::Cond) {
    // (swap operands, condition)
    match (cond, negate) {
        (Cond::Gt, false) => (false, x86::Cond::A),
        (Cond::Ge, false) => (false, x86::Cond::Ae),
        (Cond::Lt, false) => (true, x86::Cond::A),
        (Cond::Le, false) => (true, x86::Cond::Ae),
        (Cond::Gt, true) => (false, x86::Cond::Be),
        (Cond::Ge, true) => (false, x86::Cond::B),
        (Cond::Lt, true) => (true, x86::Cond::Be),
        (Cond::Le, true) => (true, x86::Cond::B),
        (Cond::Eq, _) | (Cond::Ne, _) => (false, x86::Cond::E),
    }
}

impl X86_64Emitter {
    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// Encode a short sequence into a scratch buffer to learn its length.
    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut X86_64Assembler::new(&mut buf));
        buf.code().to_vec()
    }

    /// rax = op stack base, rcx = &stack_pos, rdx = stack_pos
    fn load_stack_pointers(&mut self) {
        let mut asm = self.asm();
        asm.mov_rm(x86::Reg::Rax, Mem::Base(x86::Reg::Rbp, slots::OP_STACK));
        asm.mov_rm(x86::Reg::Rcx, Mem::Base(x86::Reg::Rbp, slots::STACK_POS));
        asm.mov_rm(x86::Reg::Rdx, Mem::Base(x86::Reg::Rcx, 0));
    }

    /// Load the stack pointers and branch out if the stack is full. The
    /// capacity sits in the word below the base.
    fn push_check(&mut self) -> usize {
        self.load_stack_pointers();
        let mut asm = self.asm();
        asm.alu_rm(0x39, x86::Reg::Rdx, Mem::Base(x86::Reg::Rax, -8));
        asm.jcc_rel32(x86::Cond::Ge, 0)
    }

    /// Branch out if the stack is empty, otherwise drop the position by one
    /// and leave rdx indexing the popped word.
    fn pop_check(&mut self) -> usize {
        self.load_stack_pointers();
        let mut asm = self.asm();
        asm.cmp_ri32(x86::Reg::Rdx, 0);
        let anchor = asm.jcc_rel32(x86::Cond::Le, 0);
        asm.dec_m(Mem::Base(x86::Reg::Rcx, 0));
        asm.sub_ri32(x86::Reg::Rdx, 1);
        anchor
    }

    fn patch_rel32(code: &mut [u8], anchor: usize, target: usize) -> Result<(), CompileError> {
        let rel = target as i64 - (anchor as i64 + 4);
        let rel32 = i32::try_from(rel).map_err(|_| CompileError::BranchOutOfRange(rel))?;
        if anchor + 4 > code.len() {
            return Err(CompileError::BranchOutOfRange(rel));
        }
        debug_assert_eq!(read_u32(code, anchor), 0);
        write_u32(code, anchor, rel32 as u32);
        Ok(())
    }
}

const TOP: Mem = Mem::Index8(x86::Reg::Rax, x86::Reg::Rdx);

impl Emitter for X86_64Emitter {
    const NAME: &'static str = "x86_64";
    const PRIMARY: &'static [Reg] = &[Reg(6), Reg(7), Reg(8), Reg(9), Reg(10)];
    const AUXILIARY: &'static [Reg] = &[Reg(3), Reg(12), Reg(13), Reg(14)];
    const FLOATS: &'static [FReg] = &[FReg(2), FReg(3), FReg(4), FReg(5), FReg(6), FReg(7)];
    const FALLBACK: Reg = Reg(11);
    const FALLBACK_FLOAT: FReg = FReg(1);
    const MAX_CONSTANTS: usize = 256;

    fn new() -> Self {
        Self {
            buf: CodeBuffer::with_capacity(4096),
            frame_size: 0,
        }
    }

    fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn into_buffer(self) -> CodeBuffer {
        self.buf
    }

    fn prologue(&mut self, frame: &FrameLayout) {
        use x86::Reg::*;

        self.frame_size = frame.size();
        let size = frame.size();
        let mut asm = self.asm();
        asm.push(Rbp);
        asm.mov_rr(Rbp, Rsp);
        asm.sub_ri32(Rsp, size);
        for reg in SAVED {
            asm.push(reg);
        }

        for (reg, slot) in [
            (Rdi, slots::CLS_ID),
            (Rsi, slots::MTHD_ID),
            (Rdx, slots::CLASS_MEM),
            (Rcx, slots::INSTANCE_MEM),
            (R8, slots::OP_STACK),
            (R9, slots::STACK_POS),
        ] {
            asm.mov_mr(Mem::Base(Rbp, slot), reg);
        }
        asm.mov_rm(Rax, Mem::Base(Rbp, 16));
        asm.mov_mr(Mem::Base(Rbp, slots::CALL_STACK), Rax);
        asm.mov_rm(Rax, Mem::Base(Rbp, 24));
        asm.mov_mr(Mem::Base(Rbp, slots::CALL_STACK_POS), Rax);

        let (low, words) = frame.zeroed_area();
        if words > 0 {
            asm.lea(Rdi, Mem::Base(Rbp, low));
            asm.mov_ri32(Rcx, words as i32);
            asm.xor_rr(Rax, Rax);
            asm.rep_stosq();
        }
    }

    fn epilogue(&mut self, status: i64) {
        use x86::Reg::*;

        let saved = self.frame_size + SAVED.len() as i32 * 8;
        let mut asm = self.asm();
        asm.mov_ri32(Rax, status as i32);
        asm.lea(Rsp, Mem::Base(Rbp, -saved));
        for reg in SAVED.iter().rev() {
            asm.pop(*reg);
        }
        asm.leave();
        asm.ret();
    }

    fn mov_imm(&mut self, dst: Reg, imm: i32) {
        self.asm().mov_ri32(hw(dst), imm);
    }

    fn load_const(&mut self, dst: Reg) -> usize {
        self.asm().mov_rm(hw(dst), Mem::Rip);
        self.buf.offset() - 4
    }

    fn load(&mut self, dst: Reg, base: Base, disp: i32, width: Width) {
        let m = mem(base, disp);
        let mut asm = self.asm();
        match width {
            Width::Word => asm.mov_rm(hw(dst), m),
            Width::Char => asm.mov_rm32(hw(dst), m),
            Width::Byte => asm.movzx_rm8(hw(dst), m),
        }
    }

    fn store(&mut self, src: Reg, base: Base, disp: i32, width: Width) {
        let m = mem(base, disp);
        let mut asm = self.asm();
        match width {
            Width::Word => asm.mov_mr(m, hw(src)),
            Width::Char => asm.mov_mr32(m, hw(src)),
            Width::Byte => asm.mov_mr8(m, hw(src)),
        }
    }

    fn store_imm(&mut self, imm: i32, base: Base, disp: i32, width: Width) {
        let m = mem(base, disp);
        let mut asm = self.asm();
        match width {
            Width::Word => asm.mov_mi(m, imm),
            Width::Char => asm.mov_mi32(m, imm),
            Width::Byte => asm.mov_mi8(m, imm as u8),
        }
    }

    fn int_op(&mut self, op: IntOp, dst: Reg, src: Operand) {
        let dst = hw(dst);
        let mut asm = self.asm();
        if let Some((opcode, ext)) = alu_codes(op) {
            match src {
                Operand::Imm(imm) => asm.alu_ri(ext, dst, imm),
                Operand::Reg(r) => asm.alu_rr(opcode, dst, hw(r)),
                Operand::Mem(base, disp) => asm.alu_rm(opcode, dst, mem(base, disp)),
            }
            return;
        }
        match op {
            IntOp::Mul => match src {
                Operand::Imm(imm) => asm.imul_rri32(dst, dst, imm),
                Operand::Reg(r) => asm.imul_rr(dst, hw(r)),
                Operand::Mem(base, disp) => asm.imul_rm(dst, mem(base, disp)),
            },
            IntOp::Shl | IntOp::Shr => {
                let ext = if op == IntOp::Shl { 4 } else { 7 };
                match src {
                    Operand::Imm(imm) => asm.shift_ri(ext, dst, (imm & 63) as u8),
                    Operand::Reg(r) => {
                        asm.mov_rr(x86::Reg::Rcx, hw(r));
                        asm.shift_cl(ext, dst);
                    }
                    Operand::Mem(base, disp) => {
                        asm.mov_rm(x86::Reg::Rcx, mem(base, disp));
                        asm.shift_cl(ext, dst);
                    }
                }
            }
            _ => unreachable!("handled by the group-1 encodings"),
        }
    }

    fn div(&mut self, dst: Reg, src: Reg, modulo: bool) {
        let (dst, src) = (hw(dst), hw(src));
        // idiv faults on MIN / -1, so -1 takes a separate path
        let fallback = Self::encode(|a| {
            if modulo {
                a.xor_rr(dst, dst);
            } else {
                a.neg(dst);
            }
        });
        let normal = Self::encode(|a| {
            a.mov_rr(x86::Reg::Rax, dst);
            a.cqo();
            a.idiv(src);
            a.mov_rr(dst, if modulo { x86::Reg::Rdx } else { x86::Reg::Rax });
        });

        let mut asm = self.asm();
        asm.cmp_ri32(src, -1);
        asm.jcc_rel8(x86::Cond::Ne, (fallback.len() + 2) as i8);
        self.buf.emit_bytes(&fallback);
        self.asm().jmp_rel8(normal.len() as i8);
        self.buf.emit_bytes(&normal);
    }

    fn cmp(&mut self, lhs: Reg, rhs: Operand) {
        let lhs = hw(lhs);
        let mut asm = self.asm();
        match rhs {
            Operand::Imm(imm) => asm.cmp_ri32(lhs, imm),
            Operand::Reg(r) => asm.cmp_rr(lhs, hw(r)),
            Operand::Mem(base, disp) => asm.alu_rm(0x39, lhs, mem(base, disp)),
        }
    }

    fn set_cond(&mut self, cond: Cond, dst: Reg) {
        let mut asm = self.asm();
        asm.setcc(int_cond(cond), x86::Reg::R11);
        asm.movzx_rr8(hw(dst), x86::Reg::R11);
    }

    fn branch(&mut self, cond: Cond) -> usize {
        self.asm().jcc_rel32(int_cond(cond), 0)
    }

    fn jump(&mut self) -> usize {
        self.asm().jmp_rel32(0)
    }

    fn load_float(&mut self, dst: FReg, base: Base, disp: i32) {
        self.asm().movsd_xm(dst.0, mem(base, disp));
    }

    fn store_float(&mut self, src: FReg, base: Base, disp: i32) {
        self.asm().movsd_mx(mem(base, disp), src.0);
    }

    fn load_float_const(&mut self, dst: FReg) -> usize {
        self.asm().movsd_xm(dst.0, Mem::Rip);
        self.buf.offset() - 4
    }

    fn float_op(&mut self, op: FloatOp, dst: FReg, src: FOperand) {
        let opcode = match op {
            FloatOp::Add => 0x58,
            FloatOp::Mul => 0x59,
            FloatOp::Sub => 0x5C,
            FloatOp::Div => 0x5E,
        };
        let mut asm = self.asm();
        match src {
            FOperand::Reg(r) => asm.sd_rr(opcode, dst.0, r.0),
            FOperand::Mem(base, disp) => asm.sd_rm(opcode, dst.0, mem(base, disp)),
        }
    }

    fn float_branch(&mut self, cond: Cond, negate: bool, lhs: FReg, rhs: FReg) -> Vec<usize> {
        let effective = if negate { cond.negate() } else { cond };
        let mut asm = self.asm();
        match effective {
            // unordered must not count as equal
            Cond::Eq => {
                asm.ucomisd(lhs.0, rhs.0);
                asm.jcc_rel8(x86::Cond::P, 6);
                vec![asm.jcc_rel32(x86::Cond::E, 0)]
            }
            Cond::Ne => {
                asm.ucomisd(lhs.0, rhs.0);
                let unordered = asm.jcc_rel32(x86::Cond::P, 0);
                vec![unordered, asm.jcc_rel32(x86::Cond::Ne, 0)]
            }
            _ => {
                let (swap, cc) = float_cmp(cond, negate);
                if swap {
                    asm.ucomisd(rhs.0, lhs.0);
                } else {
                    asm.ucomisd(lhs.0, rhs.0);
                }
                vec![asm.jcc_rel32(cc, 0)]
            }
        }
    }

    fn float_set(&mut self, cond: Cond, lhs: FReg, rhs: FReg, dst: Reg) {
        use x86::Reg::{R11, Rax};

        let mut asm = self.asm();
        match cond {
            Cond::Eq => {
                asm.ucomisd(lhs.0, rhs.0);
                asm.setcc(x86::Cond::E, R11);
                asm.setcc(x86::Cond::Np, Rax);
                asm.alu_rr8(0x21, R11, Rax);
            }
            Cond::Ne => {
                asm.ucomisd(lhs.0, rhs.0);
                asm.setcc(x86::Cond::Ne, R11);
                asm.setcc(x86::Cond::P, Rax);
                asm.alu_rr8(0x09, R11, Rax);
            }
            _ => {
                let (swap, cc) = float_cmp(cond, false);
                if swap {
                    asm.ucomisd(rhs.0, lhs.0);
                } else {
                    asm.ucomisd(lhs.0, rhs.0);
                }
                asm.setcc(cc, R11);
            }
        }
        asm.movzx_rr8(hw(dst), R11);
    }

    fn int_to_float(&mut self, dst: FReg, src: Reg) {
        self.asm().cvtsi2sd(dst.0, hw(src));
    }

    fn float_to_int(&mut self, dst: Reg, src: FReg) {
        // cvttsd2si already yields 0x8000_0000_0000_0000 for NaN and overflow
        self.asm().cvttsd2si(hw(dst), src.0);
    }

    fn op_stack_push(&mut self, src: Operand) -> usize {
        let full = self.push_check();
        let mut asm = self.asm();
        match src {
            Operand::Imm(imm) => asm.mov_mi(TOP, imm),
            Operand::Reg(r) => asm.mov_mr(TOP, hw(r)),
            Operand::Mem(base, disp) => {
                asm.mov_rm(x86::Reg::R11, mem(base, disp));
                asm.mov_mr(TOP, x86::Reg::R11);
            }
        }
        asm.inc_m(Mem::Base(x86::Reg::Rcx, 0));
        full
    }

    fn op_stack_push_float(&mut self, src: FReg) -> usize {
        let full = self.push_check();
        let mut asm = self.asm();
        asm.movsd_mx(TOP, src.0);
        asm.inc_m(Mem::Base(x86::Reg::Rcx, 0));
        full
    }

    fn op_stack_pop(&mut self, dst: Reg) -> usize {
        let empty = self.pop_check();
        self.asm().mov_rm(hw(dst), TOP);
        empty
    }

    fn op_stack_pop_float(&mut self, dst: FReg) -> usize {
        let empty = self.pop_check();
        self.asm().movsd_xm(dst.0, TOP);
        empty
    }

    fn call_dispatcher(&mut self, target: usize, op_id: i64, instr: usize, ip: i64) {
        use x86::Reg::*;

        let frame = |slot| Mem::Base(Rbp, slot);
        let mut asm = self.asm();
        asm.mov_ri32(Rdi, op_id as i32);
        asm.mov_ri64(Rsi, instr as i64);
        asm.mov_rm(Rdx, frame(slots::CLS_ID));
        asm.mov_rm(Rcx, frame(slots::MTHD_ID));
        asm.mov_rm(R8, frame(slots::INSTANCE_MEM));
        asm.mov_rm(R9, frame(slots::OP_STACK));
        // stack arguments, last first; 32 bytes keep rsp 16-aligned
        asm.push_imm(ip as i32);
        asm.push_m(frame(slots::CALL_STACK_POS));
        asm.push_m(frame(slots::CALL_STACK));
        asm.push_m(frame(slots::STACK_POS));
        asm.mov_ri64(R11, target as i64);
        asm.call_r(R11);
        asm.add_ri32(Rsp, 32);
    }

    fn patch_branch(code: &mut [u8], anchor: usize, target: usize) -> Result<(), CompileError> {
        Self::patch_rel32(code, anchor, target)
    }

    fn patch_constant(code: &mut [u8], anchor: usize, slot: usize) -> Result<(), CompileError> {
        Self::patch_rel32(code, anchor, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{MemoryContext, Method, Op};

    fn emit(f: impl FnOnce(&mut X86_64Emitter)) -> Vec<u8> {
        let mut e = X86_64Emitter::new();
        f(&mut e);
        e.into_buffer().code().to_vec()
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let method = Method::new(
            "m",
            0,
            1,
            vec![Op::LoadIntVar { id: 0, ctx: MemoryContext::Local }, Op::Rtrn],
        );
        let frame = FrameLayout::build(&method, 11).unwrap();
        let code = emit(|e| {
            e.prologue(&frame);
            e.epilogue(0);
        });
        // push rbp; mov rbp, rsp; sub rsp, 160
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(&code[4..11], &[0x48, 0x81, 0xEC, 160, 0, 0, 0]);
        // push rbx; push r12
        assert_eq!(&code[11..14], &[0x53, 0x41, 0x54]);
        // rep stosq, then mov rax, 0
        let stos = code.windows(3).position(|w| w == [0xF3, 0x48, 0xAB]).unwrap();
        assert_eq!(&code[stos + 3..stos + 10], &[0x48, 0xC7, 0xC0, 0, 0, 0, 0]);
        // ... pop rbx; leave; ret
        assert_eq!(&code[code.len() - 3..], &[0x5B, 0xC9, 0xC3]);
    }

    #[test]
    fn test_div_sequence_lengths() {
        let code = emit(|e| e.div(Reg(6), Reg(7), false));
        // cmp rdi, -1; jne +5; neg rsi; jmp +11
        assert_eq!(&code[..4], &[0x48, 0x83, 0xFF, 0xFF]);
        assert_eq!(&code[4..6], &[0x75, 5]);
        assert_eq!(&code[6..9], &[0x48, 0xF7, 0xDE]);
        assert_eq!(&code[9..11], &[0xEB, 11]);
        assert_eq!(code.len(), 11 + 11);
        // the normal path ends with mov rsi, rax
        assert_eq!(&code[code.len() - 3..], &[0x48, 0x89, 0xC6]);

        let code = emit(|e| e.div(Reg(6), Reg(7), true));
        assert_eq!(&code[code.len() - 3..], &[0x48, 0x89, 0xD6]);
    }

    #[test]
    fn test_branch_anchor_is_displacement() {
        let mut e = X86_64Emitter::new();
        e.mov_imm(Reg(6), 1);
        let anchor = e.branch(Cond::Lt);
        let code = e.into_buffer().code().to_vec();
        assert_eq!(&code[anchor - 2..anchor], &[0x0F, 0x8C]);
        assert_eq!(anchor + 4, code.len());
    }

    #[test]
    fn test_float_branch_forms() {
        let mut e = X86_64Emitter::new();
        let anchors = e.float_branch(Cond::Ne, false, FReg(2), FReg(3));
        assert_eq!(anchors.len(), 2);
        let mut e2 = X86_64Emitter::new();
        let anchors = e2.float_branch(Cond::Eq, false, FReg(2), FReg(3));
        assert_eq!(anchors.len(), 1);
        let code = e2.into_buffer().code().to_vec();
        // ucomisd; jp +6; je rel32
        assert_eq!(&code[..4], &[0x66, 0x0F, 0x2E, 0xD3]);
        assert_eq!(&code[4..6], &[0x7A, 6]);
        assert_eq!(&code[6..8], &[0x0F, 0x84]);

        // !(a < b) swaps operands and takes BE
        let code = emit(|e| {
            e.float_branch(Cond::Lt, true, FReg(2), FReg(3));
        });
        assert_eq!(&code[..4], &[0x66, 0x0F, 0x2E, 0xDA]);
        assert_eq!(&code[4..6], &[0x0F, 0x86]);
    }

    #[test]
    fn test_op_stack_push_imm() {
        let mut anchor = 0;
        let code = emit(|e| anchor = e.op_stack_push(Operand::Imm(7)));
        let tail = [0x48, 0xC7, 0x04, 0xD0, 7, 0, 0, 0, 0x48, 0xFF, 0x01];
        assert_eq!(&code[code.len() - tail.len()..], &tail);
        // cmp rdx, [rax - 8]; jge full
        assert_eq!(&code[anchor - 6..anchor], &[0x48, 0x3B, 0x50, 0xF8, 0x0F, 0x8D]);
        assert_eq!(anchor + 4, code.len() - tail.len());
    }

    #[test]
    fn test_op_stack_pop_checks_before_decrement() {
        let mut anchor = 0;
        let code = emit(|e| anchor = e.op_stack_pop(Reg(6)));
        // cmp rdx, 0; jle empty
        assert_eq!(&code[anchor - 6..anchor], &[0x48, 0x83, 0xFA, 0x00, 0x0F, 0x8E]);
        // dec qword [rcx]; sub rdx, 1; mov rsi, [rax + rdx * 8]
        assert_eq!(
            &code[anchor + 4..],
            &[0x48, 0xFF, 0x09, 0x48, 0x83, 0xEA, 0x01, 0x48, 0x8B, 0x34, 0xD0]
        );
    }

    #[test]
    fn test_call_dispatcher_keeps_stack_balanced() {
        let code = emit(|e| e.call_dispatcher(0x1000, 3, 0x2000, 9));
        // call r11; add rsp, 32
        assert_eq!(&code[code.len() - 7..], &[0x41, 0xFF, 0xD3, 0x48, 0x83, 0xC4, 0x20]);
        assert!(code.windows(5).any(|w| w == [0x68, 9, 0, 0, 0]));
    }

    #[test]
    fn test_patch_range() {
        let mut code = vec![0u8; 8];
        X86_64Emitter::patch_branch(&mut code, 0, 0).unwrap();
        assert_eq!(&code[..4], &(-4i32).to_le_bytes());
        assert!(matches!(
            X86_64Emitter::patch_branch(&mut vec![0u8; 8], 4, usize::MAX / 2),
            Err(CompileError::BranchOutOfRange(_))
        ));
    }
}
