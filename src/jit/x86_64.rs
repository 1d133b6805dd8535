//! x86-64 instruction encoding.
//!
//! Every instruction is encoded as bytes into a [`CodeBuffer`]. Memory
//! operands go through a single ModR/M + SIB encoder, so each instruction
//! form only states its opcode and operand roles.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub fn from_u8(n: u8) -> Self {
        match n & 0xF {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }

    /// Lower 3 bits of the encoding.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Condition codes for Jcc and SETcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn invert(self) -> Self {
        // Condition codes come in complementary pairs differing in bit 0.
        match self as u8 ^ 1 {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// A memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[base + disp]`
    Base(Reg, i32),
    /// `[base + index * 8]`
    Index8(Reg, Reg),
    /// `[rip + disp32]`; the displacement is always the last four bytes of
    /// the instruction.
    Rip,
}

impl Mem {
    fn rex_x(self) -> u8 {
        match self {
            Mem::Index8(_, index) if index.is_extended() => 0x02,
            _ => 0,
        }
    }

    fn rex_b(self) -> u8 {
        match self {
            Mem::Base(base, _) | Mem::Index8(base, _) if base.is_extended() => 0x01,
            _ => 0,
        }
    }
}

const REX: u8 = 0x40;
const REX_W: u8 = 0x48;

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== Encoding helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX for a register-direct form: `reg` in ModR/M.reg, `rm` in ModR/M.rm.
    fn rex_rr(&mut self, w: bool, reg: u8, rm: u8, force: bool) {
        let rex = if w { REX_W } else { REX }
            | if reg >= 8 { 0x04 } else { 0 }
            | if rm >= 8 { 0x01 } else { 0 };
        if rex != REX || force {
            self.buf.emit_u8(rex);
        }
    }

    fn rex_mem(&mut self, w: bool, reg: u8, mem: Mem, force: bool) {
        let rex = if w { REX_W } else { REX }
            | if reg >= 8 { 0x04 } else { 0 }
            | mem.rex_x()
            | mem.rex_b();
        if rex != REX || force {
            self.buf.emit_u8(rex);
        }
    }

    /// ModR/M, SIB and displacement for a memory operand.
    fn emit_mem(&mut self, reg: u8, mem: Mem) {
        match mem {
            Mem::Base(base, disp) => {
                let needs_sib = base.code() == 0b100;
                // rbp/r13 with mod=00 would mean rip/disp32
                if disp == 0 && base.code() != 0b101 {
                    self.buf.emit_u8(Self::modrm(0b00, reg, base.code()));
                    if needs_sib {
                        self.buf.emit_u8(0x24);
                    }
                } else if (-128..=127).contains(&disp) {
                    self.buf.emit_u8(Self::modrm(0b01, reg, base.code()));
                    if needs_sib {
                        self.buf.emit_u8(0x24);
                    }
                    self.buf.emit_u8(disp as u8);
                } else {
                    self.buf.emit_u8(Self::modrm(0b10, reg, base.code()));
                    if needs_sib {
                        self.buf.emit_u8(0x24);
                    }
                    self.buf.emit_u32(disp as u32);
                }
            }
            Mem::Index8(base, index) => {
                let sib = (0b11 << 6) | (index.code() << 3) | base.code();
                if base.code() == 0b101 {
                    self.buf.emit_u8(Self::modrm(0b01, reg, 0b100));
                    self.buf.emit_u8(sib);
                    self.buf.emit_u8(0);
                } else {
                    self.buf.emit_u8(Self::modrm(0b00, reg, 0b100));
                    self.buf.emit_u8(sib);
                }
            }
            Mem::Rip => {
                self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
                self.buf.emit_u32(0);
            }
        }
    }

    /// `op reg, r/m` with a one- or two-byte opcode.
    fn op_rm(&mut self, w: bool, opcode: &[u8], reg: u8, mem: Mem) {
        self.rex_mem(w, reg, mem, false);
        self.buf.emit_bytes(opcode);
        self.emit_mem(reg, mem);
    }

    fn op_rr(&mut self, w: bool, opcode: &[u8], reg: u8, rm: u8) {
        self.rex_rr(w, reg, rm, false);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    /// SSE form: mandatory prefix, optional REX, `0F op`.
    fn sse_rr(&mut self, prefix: u8, w: bool, op: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        self.rex_rr(w, reg, rm, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    fn sse_rm(&mut self, prefix: u8, op: u8, reg: u8, mem: Mem) {
        self.buf.emit_u8(prefix);
        self.rex_mem(false, reg, mem, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(op);
        self.emit_mem(reg, mem);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x89], src as u8, dst as u8);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_rr(true, 0, dst as u8, false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_rr(true, 0, dst as u8, false);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, m64
    pub fn mov_rm(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8B], dst as u8, mem);
    }

    /// MOV r32, m32 (zero-extends)
    pub fn mov_rm32(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x8B], dst as u8, mem);
    }

    /// MOVZX r64, m8
    pub fn movzx_rm8(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x0F, 0xB6], dst as u8, mem);
    }

    /// MOVZX r64, r8. Always emits REX so SPL..DIL and R8B..R15B are reachable.
    pub fn movzx_rr8(&mut self, dst: Reg, src: Reg) {
        self.rex_rr(true, dst as u8, src as u8, true);
        self.buf.emit_bytes(&[0x0F, 0xB6]);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOV m64, r64
    pub fn mov_mr(&mut self, mem: Mem, src: Reg) {
        self.op_rm(true, &[0x89], src as u8, mem);
    }

    /// MOV m32, r32
    pub fn mov_mr32(&mut self, mem: Mem, src: Reg) {
        self.op_rm(false, &[0x89], src as u8, mem);
    }

    /// MOV m8, r8
    pub fn mov_mr8(&mut self, mem: Mem, src: Reg) {
        self.rex_mem(false, src as u8, mem, true);
        self.buf.emit_u8(0x88);
        self.emit_mem(src.code(), mem);
    }

    /// MOV m64, imm32 (sign-extended)
    pub fn mov_mi(&mut self, mem: Mem, imm: i32) {
        self.op_rm(true, &[0xC7], 0, mem);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV m32, imm32
    pub fn mov_mi32(&mut self, mem: Mem, imm: i32) {
        self.op_rm(false, &[0xC7], 0, mem);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV m8, imm8
    pub fn mov_mi8(&mut self, mem: Mem, imm: u8) {
        self.op_rm(false, &[0xC6], 0, mem);
        self.buf.emit_u8(imm);
    }

    /// LEA r64, m
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8D], dst as u8, mem);
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH imm32 (sign-extended to 64 bits)
    pub fn push_imm(&mut self, imm: i32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm as u32);
    }

    /// PUSH m64
    pub fn push_m(&mut self, mem: Mem) {
        self.op_rm(false, &[0xFF], 6, mem);
    }

    /// REP STOSQ
    pub fn rep_stosq(&mut self) {
        self.buf.emit_bytes(&[0xF3, REX_W, 0xAB]);
    }

    // ==================== Integer Arithmetic ====================

    /// Group-1 ALU operation with register source. `opcode` is the
    /// `r/m64, r64` form (ADD 01, OR 09, AND 21, SUB 29, XOR 31, CMP 39).
    pub fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.op_rr(true, &[opcode], src as u8, dst as u8);
    }

    /// Group-1 ALU operation with memory source; `opcode + 2` is the
    /// `r64, r/m64` form.
    pub fn alu_rm(&mut self, opcode: u8, dst: Reg, mem: Mem) {
        self.op_rm(true, &[opcode + 2], dst as u8, mem);
    }

    /// Group-1 ALU operation with immediate; `ext` is the ModR/M.reg digit
    /// (ADD 0, OR 1, AND 4, SUB 5, XOR 6, CMP 7).
    pub fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex_rr(true, 0, dst as u8, false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// Group-1 ALU operation on a byte register pair (`r/m8, r8` form).
    pub fn alu_rr8(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_rr(false, src as u8, dst as u8, false);
        self.buf.emit_u8(opcode - 1);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    pub fn cmp_rr(&mut self, lhs: Reg, rhs: Reg) {
        self.alu_rr(0x39, lhs, rhs);
    }

    pub fn cmp_ri32(&mut self, lhs: Reg, imm: i32) {
        self.alu_ri(7, lhs, imm);
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x0F, 0xAF], dst as u8, src as u8);
    }

    /// IMUL r64, m64
    pub fn imul_rm(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x0F, 0xAF], dst as u8, mem);
    }

    /// IMUL r64, r64, imm32
    pub fn imul_rri32(&mut self, dst: Reg, src: Reg, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.op_rr(true, &[0x6B], dst as u8, src as u8);
            self.buf.emit_u8(imm as u8);
        } else {
            self.op_rr(true, &[0x69], dst as u8, src as u8);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IDIV r64 (RDX:RAX / src)
    pub fn idiv(&mut self, src: Reg) {
        self.rex_rr(true, 0, src as u8, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// CQO (sign-extend RAX into RDX)
    pub fn cqo(&mut self) {
        self.buf.emit_bytes(&[REX_W, 0x99]);
    }

    pub fn neg(&mut self, dst: Reg) {
        self.rex_rr(true, 0, dst as u8, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// Shift by immediate; `ext` is SHL 4, SHR 5, SAR 7.
    pub fn shift_ri(&mut self, ext: u8, dst: Reg, imm: u8) {
        self.rex_rr(true, 0, dst as u8, false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// Shift by CL.
    pub fn shift_cl(&mut self, ext: u8, dst: Reg) {
        self.rex_rr(true, 0, dst as u8, false);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
    }

    /// INC m64 / DEC m64
    pub fn inc_m(&mut self, mem: Mem) {
        self.op_rm(true, &[0xFF], 0, mem);
    }

    pub fn dec_m(&mut self, mem: Mem) {
        self.op_rm(true, &[0xFF], 1, mem);
    }

    // ==================== Control Flow ====================

    /// JMP rel32; returns the offset of the displacement.
    pub fn jmp_rel32(&mut self, rel: i32) -> usize {
        self.buf.emit_u8(0xE9);
        let at = self.buf.offset();
        self.buf.emit_u32(rel as u32);
        at
    }

    pub fn jmp_rel8(&mut self, rel: i8) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_u8(rel as u8);
    }

    /// Jcc rel32; returns the offset of the displacement.
    pub fn jcc_rel32(&mut self, cond: Cond, rel: i32) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let at = self.buf.offset();
        self.buf.emit_u32(rel as u32);
        at
    }

    pub fn jcc_rel8(&mut self, cond: Cond, rel: i8) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_u8(rel as u8);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    /// SETcc r8. Always emits REX so SPL..DIL map to the low byte registers.
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex_rr(false, 0, dst as u8, true);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    // ==================== SSE2 Floating Point ====================

    /// MOVSD xmm, m64
    pub fn movsd_xm(&mut self, dst: u8, mem: Mem) {
        self.sse_rm(0xF2, 0x10, dst, mem);
    }

    /// MOVSD m64, xmm
    pub fn movsd_mx(&mut self, mem: Mem, src: u8) {
        self.sse_rm(0xF2, 0x11, src, mem);
    }

    /// Scalar double arithmetic: ADDSD 58, MULSD 59, SUBSD 5C, DIVSD 5E.
    pub fn sd_rr(&mut self, op: u8, dst: u8, src: u8) {
        self.sse_rr(0xF2, false, op, dst, src);
    }

    pub fn sd_rm(&mut self, op: u8, dst: u8, mem: Mem) {
        self.sse_rm(0xF2, op, dst, mem);
    }

    /// UCOMISD xmm, xmm
    pub fn ucomisd(&mut self, lhs: u8, rhs: u8) {
        self.sse_rr(0x66, false, 0x2E, lhs, rhs);
    }

    /// CVTSI2SD xmm, r64
    pub fn cvtsi2sd(&mut self, dst: u8, src: Reg) {
        self.sse_rr(0xF2, true, 0x2A, dst, src as u8);
    }

    /// CVTTSD2SI r64, xmm
    pub fn cvttsd2si(&mut self, dst: Reg, src: u8) {
        self.sse_rr(0xF2, true, 0x2C, dst as u8, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut X86_64Assembler::new(&mut buf));
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(encode(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(encode(|a| a.mov_rr(Reg::R9, Reg::R8)), [0x4D, 0x89, 0xC1]);
    }

    #[test]
    fn test_mov_ri64() {
        assert_eq!(
            encode(|a| a.mov_ri64(Reg::R11, 0x123456789ABCDEF0u64 as i64)),
            [0x49, 0xBB, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_frame_relative_memory() {
        // MOV RAX, [RBP-8] = 48 8B 45 F8
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Mem::Base(Reg::Rbp, -8))),
            [0x48, 0x8B, 0x45, 0xF8]
        );
        // MOV [RBP-200], RSI = 48 89 B5 38 FF FF FF
        assert_eq!(
            encode(|a| a.mov_mr(Mem::Base(Reg::Rbp, -200), Reg::Rsi)),
            [0x48, 0x89, 0xB5, 0x38, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_base_needing_sib_or_disp() {
        // MOV RAX, [R12] = 49 8B 04 24
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Mem::Base(Reg::R12, 0))),
            [0x49, 0x8B, 0x04, 0x24]
        );
        // MOV RAX, [R13] = 49 8B 45 00
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Mem::Base(Reg::R13, 0))),
            [0x49, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_indexed_store() {
        // MOV [RAX+RDX*8], R9 = 4C 89 0C D0
        assert_eq!(
            encode(|a| a.mov_mr(Mem::Index8(Reg::Rax, Reg::Rdx), Reg::R9)),
            [0x4C, 0x89, 0x0C, 0xD0]
        );
        // MOV QWORD [RAX+RDX*8], 7 = 48 C7 04 D0 07 00 00 00
        assert_eq!(
            encode(|a| a.mov_mi(Mem::Index8(Reg::Rax, Reg::Rdx), 7)),
            [0x48, 0xC7, 0x04, 0xD0, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_rip_relative() {
        // MOV RSI, [RIP+0] = 48 8B 35 00 00 00 00
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rsi, Mem::Rip)),
            [0x48, 0x8B, 0x35, 0, 0, 0, 0]
        );
        // MOVSD XMM2, [RIP+0] = F2 0F 10 15 00 00 00 00
        assert_eq!(
            encode(|a| a.movsd_xm(2, Mem::Rip)),
            [0xF2, 0x0F, 0x10, 0x15, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_alu() {
        // ADD RSI, RDI = 48 01 FE
        assert_eq!(encode(|a| a.add_rr(Reg::Rsi, Reg::Rdi)), [0x48, 0x01, 0xFE]);
        // SUB R8, 1 = 49 83 E8 01
        assert_eq!(encode(|a| a.sub_ri32(Reg::R8, 1)), [0x49, 0x83, 0xE8, 0x01]);
        // CMP RSI, 1000 = 48 81 FE E8 03 00 00
        assert_eq!(
            encode(|a| a.cmp_ri32(Reg::Rsi, 1000)),
            [0x48, 0x81, 0xFE, 0xE8, 0x03, 0x00, 0x00]
        );
        // ADD RSI, [RBP-72] = 48 03 75 B8
        assert_eq!(
            encode(|a| a.alu_rm(0x01, Reg::Rsi, Mem::Base(Reg::Rbp, -72))),
            [0x48, 0x03, 0x75, 0xB8]
        );
    }

    #[test]
    fn test_imul_idiv() {
        // IMUL RSI, RDI = 48 0F AF F7
        assert_eq!(encode(|a| a.imul_rr(Reg::Rsi, Reg::Rdi)), [0x48, 0x0F, 0xAF, 0xF7]);
        // IMUL RSI, RSI, 3 = 48 6B F6 03
        assert_eq!(encode(|a| a.imul_rri32(Reg::Rsi, Reg::Rsi, 3)), [0x48, 0x6B, 0xF6, 0x03]);
        // IDIV R8 = 49 F7 F8
        assert_eq!(encode(|a| a.idiv(Reg::R8)), [0x49, 0xF7, 0xF8]);
        assert_eq!(encode(|a| a.cqo()), [0x48, 0x99]);
    }

    #[test]
    fn test_shifts() {
        // SHL RSI, 3 = 48 C1 E6 03
        assert_eq!(encode(|a| a.shift_ri(4, Reg::Rsi, 3)), [0x48, 0xC1, 0xE6, 0x03]);
        // SAR RDI, CL = 48 D3 FF
        assert_eq!(encode(|a| a.shift_cl(7, Reg::Rdi)), [0x48, 0xD3, 0xFF]);
    }

    #[test]
    fn test_branches() {
        assert_eq!(encode(|a| { a.jmp_rel32(0x10); }), [0xE9, 0x10, 0, 0, 0]);
        assert_eq!(encode(|a| { a.jcc_rel32(Cond::L, -6); }), [0x0F, 0x8C, 0xFA, 0xFF, 0xFF, 0xFF]);
        assert_eq!(encode(|a| a.jcc_rel8(Cond::Ne, 5)), [0x75, 0x05]);
        // CALL R11 = 41 FF D3
        assert_eq!(encode(|a| a.call_r(Reg::R11)), [0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_byte_registers() {
        // SETL R11B = 41 0F 9C C3
        assert_eq!(encode(|a| a.setcc(Cond::L, Reg::R11)), [0x41, 0x0F, 0x9C, 0xC3]);
        // SETE AL = 40 0F 94 C0
        assert_eq!(encode(|a| a.setcc(Cond::E, Reg::Rax)), [0x40, 0x0F, 0x94, 0xC0]);
        // MOVZX RSI, R11B = 49 0F B6 F3
        assert_eq!(encode(|a| a.movzx_rr8(Reg::Rsi, Reg::R11)), [0x49, 0x0F, 0xB6, 0xF3]);
        // MOV [RAX], SIL = 40 88 30
        assert_eq!(encode(|a| a.mov_mr8(Mem::Base(Reg::Rax, 0), Reg::Rsi)), [0x40, 0x88, 0x30]);
        // AND R11B, AL = 41 20 C3
        assert_eq!(encode(|a| a.alu_rr8(0x21, Reg::R11, Reg::Rax)), [0x41, 0x20, 0xC3]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(encode(|a| a.push(Reg::Rbp)), [0x55]);
        assert_eq!(encode(|a| a.pop(Reg::R14)), [0x41, 0x5E]);
        // PUSH QWORD [RBP-64] = FF 75 C0
        assert_eq!(encode(|a| a.push_m(Mem::Base(Reg::Rbp, -64))), [0xFF, 0x75, 0xC0]);
        assert_eq!(encode(|a| a.push_imm(3)), [0x68, 3, 0, 0, 0]);
    }

    #[test]
    fn test_sse() {
        // ADDSD XMM2, XMM3 = F2 0F 58 D3
        assert_eq!(encode(|a| a.sd_rr(0x58, 2, 3)), [0xF2, 0x0F, 0x58, 0xD3]);
        // UCOMISD XMM2, XMM3 = 66 0F 2E D3
        assert_eq!(encode(|a| a.ucomisd(2, 3)), [0x66, 0x0F, 0x2E, 0xD3]);
        // CVTSI2SD XMM2, RSI = F2 48 0F 2A D6
        assert_eq!(encode(|a| a.cvtsi2sd(2, Reg::Rsi)), [0xF2, 0x48, 0x0F, 0x2A, 0xD6]);
        // CVTTSD2SI R8, XMM2 = F2 4C 0F 2C C2
        assert_eq!(encode(|a| a.cvttsd2si(Reg::R8, 2)), [0xF2, 0x4C, 0x0F, 0x2C, 0xC2]);
        // MOVSD [RBP-8], XMM2 = F2 0F 11 55 F8
        assert_eq!(
            encode(|a| a.movsd_mx(Mem::Base(Reg::Rbp, -8), 2)),
            [0xF2, 0x0F, 0x11, 0x55, 0xF8]
        );
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
        assert_eq!(Cond::P.invert(), Cond::Np);
    }
}
