//! [`Emitter`] for AArch64 (AAPCS64).
//!
//! All eight native arguments arrive in x0..x7. The frame pointer is x29;
//! x8, x14..x17 and d30/d31 are scratch and never allocated.

use super::aarch64::{AArch64Assembler, Access, Cond as A64Cond, Reg as A64};
use super::codebuf::{CodeBuffer, read_u32, write_u32};
use super::emitter::{
    Base, Cond, Emitter, FOperand, FReg, FloatOp, IntOp, Operand, Reg, Width,
};
use super::error::CompileError;
use super::frame::{FrameLayout, slots};

/// Operand stack base.
const STACK_BASE: A64 = A64::X14;
/// Address of the operand stack position.
const STACK_POS: A64 = A64::X15;
/// Address offsets and the stack position value.
const TMP_ADDR: A64 = A64::X16;
/// Values materialized for a single instruction.
const TMP_VALUE: A64 = A64::X17;
/// Operand stack capacity, read from the word below the base.
const STACK_LIMIT: A64 = A64::X8;
const TMP_FLOAT: u8 = 30;

pub struct AArch64Emitter {
    buf: CodeBuffer,
    frame_size: i32,
}

fn hw(reg: Reg) -> A64 {
    A64::from_u8(reg.0)
}

fn base_reg(base: Base) -> A64 {
    match base {
        Base::Frame => A64::Fp,
        Base::Reg(reg) => hw(reg),
    }
}

fn width_access(width: Width) -> Access {
    match width {
        Width::Byte => Access::Byte,
        Width::Char => Access::Word32,
        Width::Word => Access::Word64,
    }
}

fn int_cond(cond: Cond) -> A64Cond {
    match cond {
        Cond::Eq => A64Cond::Eq,
        Cond::Ne => A64Cond::Ne,
        Cond::Lt => A64Cond::Lt,
        Cond::Le => A64Cond::Le,
        Cond::Gt => A64Cond::Gt,
        Cond::Ge => A64Cond::Ge,
    }
}

/// Condition after `fcmp lhs, rhs`. An unordered result sets C and V, so
/// MI/LS/GT/GE/EQ are false on NaN and their inverses true.
fn float_cond(cond: Cond) -> A64Cond {
    match cond {
        Cond::Lt => A64Cond::Mi,
        Cond::Le => A64Cond::Ls,
        Cond::Gt => A64Cond::Gt,
        Cond::Ge => A64Cond::Ge,
        Cond::Eq => A64Cond::Eq,
        Cond::Ne => A64Cond::Ne,
    }
}

fn fits_imm9(disp: i32) -> bool {
    (-256..=255).contains(&disp)
}

impl AArch64Emitter {
    fn asm(&mut self) -> AArch64Assembler<'_> {
        AArch64Assembler::new(&mut self.buf)
    }

    fn load_access(&mut self, access: Access, rt: u8, base: Base, disp: i32) {
        let rn = base_reg(base);
        let mut asm = self.asm();
        if fits_imm9(disp) {
            asm.ldur(access, rt, rn, disp as i16);
        } else {
            asm.mov_imm64(TMP_ADDR, disp as i64);
            asm.ldr_reg(access, rt, rn, TMP_ADDR, false);
        }
    }

    fn store_access(&mut self, access: Access, rt: u8, base: Base, disp: i32) {
        let rn = base_reg(base);
        let mut asm = self.asm();
        if fits_imm9(disp) {
            asm.stur(access, rt, rn, disp as i16);
        } else {
            asm.mov_imm64(TMP_ADDR, disp as i64);
            asm.str_reg(access, rt, rn, TMP_ADDR, false);
        }
    }

    /// Bring an operand into a register, using the value scratch if needed.
    fn operand_reg(&mut self, src: Operand) -> A64 {
        match src {
            Operand::Reg(r) => hw(r),
            Operand::Imm(imm) => {
                self.asm().mov_imm64(TMP_VALUE, imm as i64);
                TMP_VALUE
            }
            Operand::Mem(base, disp) => {
                self.load_access(Access::Word64, TMP_VALUE.code(), base, disp);
                TMP_VALUE
            }
        }
    }

    /// x14 = op stack base, x15 = &stack_pos, x16 = stack_pos
    fn load_stack_pointers(&mut self) {
        let mut asm = self.asm();
        asm.ldur(Access::Word64, STACK_BASE.code(), A64::Fp, slots::OP_STACK as i16);
        asm.ldur(Access::Word64, STACK_POS.code(), A64::Fp, slots::STACK_POS as i16);
        asm.ldur(Access::Word64, TMP_ADDR.code(), STACK_POS, 0);
    }

    /// Load the stack pointers and branch out if the stack is full.
    fn push_check(&mut self) -> usize {
        self.load_stack_pointers();
        let mut asm = self.asm();
        asm.ldur(Access::Word64, STACK_LIMIT.code(), STACK_BASE, -8);
        asm.cmp(TMP_ADDR, STACK_LIMIT);
        asm.b_cond(A64Cond::Ge, 0)
    }

    /// Load the stack pointers and branch out if the stack is empty.
    fn pop_check(&mut self) -> usize {
        self.load_stack_pointers();
        let mut asm = self.asm();
        asm.cmp_imm(TMP_ADDR, 0);
        asm.b_cond(A64Cond::Le, 0)
    }

    fn bump_stack_pos(&mut self, up: bool) {
        let mut asm = self.asm();
        if up {
            asm.add_imm(TMP_ADDR, TMP_ADDR, 1);
        } else {
            asm.sub_imm(TMP_ADDR, TMP_ADDR, 1);
        }
        asm.stur(Access::Word64, TMP_ADDR.code(), STACK_POS, 0);
    }

    fn patch_word(code: &mut [u8], at: usize, delta: i64) -> Result<(), CompileError> {
        if at + 4 > code.len() || delta % 4 != 0 {
            return Err(CompileError::BranchOutOfRange(delta));
        }
        let inst = read_u32(code, at);
        let words = delta >> 2;
        let patched = if inst & 0xFC00_0000 == 0x1400_0000 {
            if !(-(1 << 25)..(1 << 25)).contains(&words) {
                return Err(CompileError::BranchOutOfRange(delta));
            }
            (inst & 0xFC00_0000) | (words as u32 & 0x03FF_FFFF)
        } else {
            // b.cond and ldr literal share the imm19 field at bit 5
            if !(-(1 << 18)..(1 << 18)).contains(&words) {
                return Err(CompileError::BranchOutOfRange(delta));
            }
            (inst & !(0x7FFFF << 5)) | ((words as u32 & 0x7FFFF) << 5)
        };
        write_u32(code, at, patched);
        Ok(())
    }
}

impl Emitter for AArch64Emitter {
    const NAME: &'static str = "aarch64";
    const PRIMARY: &'static [Reg] = &[Reg(9), Reg(10), Reg(11), Reg(12), Reg(13)];
    const AUXILIARY: &'static [Reg] = &[Reg(19), Reg(20), Reg(21), Reg(22)];
    const FLOATS: &'static [FReg] = &[FReg(16), FReg(17), FReg(18), FReg(19), FReg(20), FReg(21)];
    const FALLBACK: Reg = Reg(15);
    const FALLBACK_FLOAT: FReg = FReg(31);
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
        self.frame_size = frame.size();
        let size = frame.size() as u16;
        let mut asm = self.asm();
        asm.stp_pre(A64::Fp, A64::Lr, -16);
        asm.mov_sp(A64::Fp, A64::Sp);
        asm.sub_imm(A64::Sp, A64::Sp, size);
        asm.stp_pre(A64::X19, A64::X20, -16);
        asm.stp_pre(A64::X21, A64::X22, -16);

        let header = [
            slots::CLS_ID,
            slots::MTHD_ID,
            slots::CLASS_MEM,
            slots::INSTANCE_MEM,
            slots::OP_STACK,
            slots::STACK_POS,
            slots::CALL_STACK,
            slots::CALL_STACK_POS,
        ];
        for (arg, slot) in header.into_iter().enumerate() {
            asm.stur(Access::Word64, arg as u8, A64::Fp, slot as i16);
        }

        let (low, words) = frame.zeroed_area();
        if words > 0 {
            // x14 walks up from the lowest slot, x15 counts down
            asm.sub_imm(STACK_BASE, A64::Fp, (-low) as u16);
            asm.mov_imm64(STACK_POS, words as i64);
            asm.str_post(A64::XZR, STACK_BASE, 8);
            asm.subs_imm(STACK_POS, STACK_POS, 1);
            asm.b_cond(A64Cond::Ne, -8);
        }
    }

    fn epilogue(&mut self, status: i64) {
        let size = self.frame_size as u16;
        let mut asm = self.asm();
        asm.mov_imm64(A64::X0, status);
        asm.sub_imm(A64::Sp, A64::Fp, size);
        asm.sub_imm(A64::Sp, A64::Sp, 32);
        asm.ldp_post(A64::X21, A64::X22, 16);
        asm.ldp_post(A64::X19, A64::X20, 16);
        asm.mov_sp(A64::Sp, A64::Fp);
        asm.ldp_post(A64::Fp, A64::Lr, 16);
        asm.ret();
    }

    fn mov_imm(&mut self, dst: Reg, imm: i32) {
        self.asm().mov_imm64(hw(dst), imm as i64);
    }

    fn load_const(&mut self, dst: Reg) -> usize {
        self.asm().ldr_literal(hw(dst))
    }

    fn load(&mut self, dst: Reg, base: Base, disp: i32, width: Width) {
        self.load_access(width_access(width), dst.0, base, disp);
    }

    fn store(&mut self, src: Reg, base: Base, disp: i32, width: Width) {
        self.store_access(width_access(width), src.0, base, disp);
    }

    fn store_imm(&mut self, imm: i32, base: Base, disp: i32, width: Width) {
        if imm == 0 {
            self.store_access(width_access(width), A64::XZR.code(), base, disp);
        } else {
            self.asm().mov_imm64(TMP_VALUE, imm as i64);
            self.store_access(width_access(width), TMP_VALUE.code(), base, disp);
        }
    }

    fn int_op(&mut self, op: IntOp, dst: Reg, src: Operand) {
        let rd = hw(dst);
        match (op, src) {
            (IntOp::Add, Operand::Imm(imm)) if (0..4096).contains(&imm) => {
                self.asm().add_imm(rd, rd, imm as u16);
                return;
            }
            (IntOp::Sub, Operand::Imm(imm)) if (0..4096).contains(&imm) => {
                self.asm().sub_imm(rd, rd, imm as u16);
                return;
            }
            (IntOp::Shl, Operand::Imm(imm)) => {
                self.asm().lsl_imm(rd, rd, (imm & 63) as u8);
                return;
            }
            (IntOp::Shr, Operand::Imm(imm)) => {
                self.asm().asr_imm(rd, rd, (imm & 63) as u8);
                return;
            }
            _ => {}
        }
        let rm = self.operand_reg(src);
        let mut asm = self.asm();
        match op {
            IntOp::Add => asm.add(rd, rd, rm),
            IntOp::Sub => asm.sub(rd, rd, rm),
            IntOp::Mul => asm.mul(rd, rd, rm),
            IntOp::And => asm.and(rd, rd, rm),
            IntOp::Or => asm.orr(rd, rd, rm),
            IntOp::Xor => asm.eor(rd, rd, rm),
            IntOp::Shl => asm.lslv(rd, rd, rm),
            IntOp::Shr => asm.asrv(rd, rd, rm),
        }
    }

    fn div(&mut self, dst: Reg, src: Reg, modulo: bool) {
        // sdiv gives MIN / -1 = MIN; msub then yields MIN % -1 = 0
        let (rd, rm) = (hw(dst), hw(src));
        let mut asm = self.asm();
        if modulo {
            asm.sdiv(TMP_VALUE, rd, rm);
            asm.msub(rd, TMP_VALUE, rm, rd);
        } else {
            asm.sdiv(rd, rd, rm);
        }
    }

    fn cmp(&mut self, lhs: Reg, rhs: Operand) {
        let rn = hw(lhs);
        match rhs {
            Operand::Imm(imm) if (0..4096).contains(&imm) => self.asm().cmp_imm(rn, imm as u16),
            Operand::Imm(imm) if (-4095..0).contains(&imm) => self.asm().cmn_imm(rn, (-imm) as u16),
            _ => {
                let rm = self.operand_reg(rhs);
                self.asm().cmp(rn, rm);
            }
        }
    }

    fn set_cond(&mut self, cond: Cond, dst: Reg) {
        self.asm().cset(hw(dst), int_cond(cond));
    }

    fn branch(&mut self, cond: Cond) -> usize {
        self.asm().b_cond(int_cond(cond), 0)
    }

    fn jump(&mut self) -> usize {
        self.asm().b(0)
    }

    fn load_float(&mut self, dst: FReg, base: Base, disp: i32) {
        self.load_access(Access::Double, dst.0, base, disp);
    }

    fn store_float(&mut self, src: FReg, base: Base, disp: i32) {
        self.store_access(Access::Double, src.0, base, disp);
    }

    fn load_float_const(&mut self, dst: FReg) -> usize {
        self.asm().ldr_literal_d(dst.0)
    }

    fn float_op(&mut self, op: FloatOp, dst: FReg, src: FOperand) {
        let rm = match src {
            FOperand::Reg(r) => r.0,
            FOperand::Mem(base, disp) => {
                self.load_access(Access::Double, TMP_FLOAT, base, disp);
                TMP_FLOAT
            }
        };
        let mut asm = self.asm();
        match op {
            FloatOp::Add => asm.fadd(dst.0, dst.0, rm),
            FloatOp::Sub => asm.fsub(dst.0, dst.0, rm),
            FloatOp::Mul => asm.fmul(dst.0, dst.0, rm),
            FloatOp::Div => asm.fdiv(dst.0, dst.0, rm),
        }
    }

    fn float_branch(&mut self, cond: Cond, negate: bool, lhs: FReg, rhs: FReg) -> Vec<usize> {
        let mut cc = float_cond(cond);
        if negate {
            cc = cc.invert();
        }
        let mut asm = self.asm();
        asm.fcmp(lhs.0, rhs.0);
        vec![asm.b_cond(cc, 0)]
    }

    fn float_set(&mut self, cond: Cond, lhs: FReg, rhs: FReg, dst: Reg) {
        let mut asm = self.asm();
        asm.fcmp(lhs.0, rhs.0);
        asm.cset(hw(dst), float_cond(cond));
    }

    fn int_to_float(&mut self, dst: FReg, src: Reg) {
        self.asm().scvtf(dst.0, hw(src));
    }

    fn float_to_int(&mut self, dst: Reg, src: FReg) {
        // fcvtzs saturates and maps NaN to 0; rewrite both to MIN
        let rd = hw(dst);
        let mut asm = self.asm();
        asm.fcvtzs(rd, src.0);
        asm.mov_imm64(TMP_ADDR, i64::MIN);
        asm.fcmp(src.0, src.0);
        asm.csel(rd, TMP_ADDR, rd, A64Cond::Vs);
        asm.mov_imm64(TMP_VALUE, i64::MAX);
        asm.cmp(rd, TMP_VALUE);
        asm.csel(rd, TMP_ADDR, rd, A64Cond::Eq);
    }

    fn op_stack_push(&mut self, src: Operand) -> usize {
        // the value is materialized first; it may need x16 for its address
        let value = match src {
            Operand::Reg(r) => hw(r),
            Operand::Imm(0) => A64::XZR,
            _ => self.operand_reg(src),
        };
        let full = self.push_check();
        self.asm()
            .str_reg(Access::Word64, value.code(), STACK_BASE, TMP_ADDR, true);
        self.bump_stack_pos(true);
        full
    }

    fn op_stack_push_float(&mut self, src: FReg) -> usize {
        let full = self.push_check();
        self.asm()
            .str_reg(Access::Double, src.0, STACK_BASE, TMP_ADDR, true);
        self.bump_stack_pos(true);
        full
    }

    fn op_stack_pop(&mut self, dst: Reg) -> usize {
        let empty = self.pop_check();
        self.bump_stack_pos(false);
        self.asm()
            .ldr_reg(Access::Word64, dst.0, STACK_BASE, TMP_ADDR, true);
        empty
    }

    fn op_stack_pop_float(&mut self, dst: FReg) -> usize {
        let empty = self.pop_check();
        self.bump_stack_pos(false);
        self.asm()
            .ldr_reg(Access::Double, dst.0, STACK_BASE, TMP_ADDR, true);
        empty
    }

    fn call_dispatcher(&mut self, target: usize, op_id: i64, instr: usize, ip: i64) {
        let mut asm = self.asm();
        // arguments 9 and 10 go on the stack, which stays 16-byte aligned
        asm.sub_imm(A64::Sp, A64::Sp, 16);
        asm.ldur(Access::Word64, TMP_VALUE.code(), A64::Fp, slots::CALL_STACK_POS as i16);
        asm.str(TMP_VALUE, A64::Sp, 0);
        asm.mov_imm64(TMP_VALUE, ip);
        asm.str(TMP_VALUE, A64::Sp, 8);

        asm.mov_imm64(A64::X0, op_id);
        asm.mov_imm64(A64::X1, instr as i64);
        for (reg, slot) in [
            (A64::X2, slots::CLS_ID),
            (A64::X3, slots::MTHD_ID),
            (A64::X4, slots::INSTANCE_MEM),
            (A64::X5, slots::OP_STACK),
            (A64::X6, slots::STACK_POS),
            (A64::X7, slots::CALL_STACK),
        ] {
            asm.ldur(Access::Word64, reg.code(), A64::Fp, slot as i16);
        }
        asm.mov_imm64(TMP_ADDR, target as i64);
        asm.blr(TMP_ADDR);
        asm.add_imm(A64::Sp, A64::Sp, 16);
    }

    fn patch_branch(code: &mut [u8], anchor: usize, target: usize) -> Result<(), CompileError> {
        Self::patch_word(code, anchor, target as i64 - anchor as i64)
    }

    fn patch_constant(code: &mut [u8], anchor: usize, slot: usize) -> Result<(), CompileError> {
        Self::patch_word(code, anchor, slot as i64 - anchor as i64)
    }
}
