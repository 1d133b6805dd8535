/// AArch64 instruction encoding for JIT compilation.
///
/// Every instruction is one little-endian 32-bit word. Branch and literal
/// forms take their displacement in bytes; placeholders are encoded with 0
/// and patched later.
use super::codebuf::CodeBuffer;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn from_u8(n: u8) -> Self {
        const ALL: [Reg; 32] = [
            Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
            Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
            Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
            Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::Fp, Reg::Lr, Reg::Sp,
        ];
        ALL[(n & 31) as usize]
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Cs = 0b0010,  // Carry set / unsigned higher or same
    Cc = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Vs = 0b0110,  // Overflow set
    Vc = 0b0111,  // Overflow clear
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
    Al = 0b1110,  // Always
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

/// Size and register file of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Byte,
    Word32,
    Word64,
    Double,
}

impl Access {
    /// (unscaled-offset base opcode, register-offset base opcode) of the load
    fn load(self) -> (u32, u32) {
        match self {
            Access::Byte => (0x38400000, 0x38606800),
            Access::Word32 => (0xB8400000, 0xB8606800),
            Access::Word64 => (0xF8400000, 0xF8606800),
            Access::Double => (0xFC400000, 0xFC606800),
        }
    }

    fn store(self) -> (u32, u32) {
        let (unscaled, register) = self.load();
        // the load/store opc bit
        (unscaled & !0x00400000, register & !0x00400000)
    }
}

fn rrr(base: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    base | ((rm as u32 & 31) << 16) | ((rn as u32 & 31) << 5) | (rd as u32 & 31)
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, Xm (64-bit add)
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x8B000000, rd.code(), rn.code(), rm.code()));
    }

    /// ADD Xd, Xn, #imm12 (64-bit add immediate; Xd/Xn may be SP)
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        // 1001 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0x91000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// SUB Xd, Xn, Xm (64-bit subtract)
    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xCB000000, rd.code(), rn.code(), rm.code()));
    }

    /// SUB Xd, Xn, #imm12 (64-bit subtract immediate; Xd/Xn may be SP)
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        // 1101 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0xD1000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// SUBS Xd, Xn, #imm12
    pub fn subs_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        let inst = 0xF1000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MUL Xd, Xn, Xm (MADD with XZR)
    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9B007C00, rd.code(), rn.code(), rm.code()));
    }

    /// MSUB Xd, Xn, Xm, Xa (Xd = Xa - Xn * Xm)
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit_raw(rrr(0x9B008000, rd.code(), rn.code(), rm.code()) | ((ra.code() as u32) << 10));
    }

    /// SDIV Xd, Xn, Xm (64-bit signed divide)
    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC00C00, rd.code(), rn.code(), rm.code()));
    }

    /// AND Xd, Xn, Xm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x8A000000, rd.code(), rn.code(), rm.code()));
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xAA000000, rd.code(), rn.code(), rm.code()));
    }

    /// EOR Xd, Xn, Xm (XOR)
    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xCA000000, rd.code(), rn.code(), rm.code()));
    }

    /// LSLV Xd, Xn, Xm (count taken modulo 64)
    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC02000, rd.code(), rn.code(), rm.code()));
    }

    /// ASRV Xd, Xn, Xm (count taken modulo 64)
    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC02800, rd.code(), rn.code(), rm.code()));
    }

    /// LSL Xd, Xn, #shift (UBFM alias)
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let shift = (shift & 63) as u32;
        let immr = (64 - shift) & 63;
        let imms = 63 - shift;
        let inst = 0xD3400000 | (immr << 16) | (imms << 10) | ((rn.code() as u32) << 5) | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// ASR Xd, Xn, #shift (SBFM alias)
    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let inst = 0x9340FC00
            | (((shift & 63) as u32) << 16)
            | ((rn.code() as u32) << 5)
            | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// NEG Xd, Xm
    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.sub(rd, Reg::XZR, rm);
    }

    /// MOV between SP and a register (ADD #0)
    pub fn mov_sp(&mut self, rd: Reg, rn: Reg) {
        self.add_imm(rd, rn, 0);
    }

    /// MOVZ Xd, #imm16, LSL #(hw * 16)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1101 0010 1hhi iiii iiii iiii iiid dddd
        let inst = 0xD2800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// MOVK Xd, #imm16, LSL #(hw * 16)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0xF2800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// MOVN Xd, #imm16, LSL #(hw * 16)
    pub fn movn(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0x92800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// Materialize an arbitrary 64-bit constant in the fewest MOVZ/MOVN/MOVK.
    pub fn mov_imm64(&mut self, rd: Reg, imm: i64) {
        let v = imm as u64;
        let inverted = !v;
        if inverted >> 16 == 0 {
            self.movn(rd, inverted as u16, 0);
            return;
        }
        let mut first = true;
        for hw in 0..4u8 {
            let part = (v >> (hw * 16)) as u16;
            if part == 0 {
                continue;
            }
            if first {
                self.movz(rd, part, hw);
                first = false;
            } else {
                self.movk(rd, part, hw);
            }
        }
        if first {
            self.movz(rd, 0, 0);
        }
    }

    // ==================== Comparison ====================

    /// CMP Xn, Xm (compare registers)
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        // SUBS XZR, Xn, Xm
        self.emit_raw(rrr(0xEB000000, Reg::XZR.code(), rn.code(), rm.code()));
    }

    /// CMP Xn, #imm12 (compare immediate)
    pub fn cmp_imm(&mut self, rn: Reg, imm12: u16) {
        self.subs_imm(Reg::XZR, rn, imm12);
    }

    /// CMN Xn, #imm12 (compare with negated immediate)
    pub fn cmn_imm(&mut self, rn: Reg, imm12: u16) {
        let inst = 0xB1000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (Reg::XZR.code() as u32);
        self.emit_raw(inst);
    }

    /// CSET Xd, cond (CSINC Xd, XZR, XZR, !cond)
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        let inst = 0x9A9F07E0 | ((cond.invert() as u32) << 12) | rd.code() as u32;
        self.emit_raw(inst);
    }

    /// CSEL Xd, Xn, Xm, cond
    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.emit_raw(rrr(0x9A800000, rd.code(), rn.code(), rm.code()) | ((cond as u32) << 12));
    }

    // ==================== Loads and Stores ====================

    /// Load with a signed 9-bit unscaled offset (LDUR family). `rt` is a
    /// general register, or a D register for [`Access::Double`].
    pub fn ldur(&mut self, access: Access, rt: u8, rn: Reg, imm9: i16) {
        let inst = access.load().0
            | (((imm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt as u32 & 31);
        self.emit_raw(inst);
    }

    pub fn stur(&mut self, access: Access, rt: u8, rn: Reg, imm9: i16) {
        let inst = access.store().0
            | (((imm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt as u32 & 31);
        self.emit_raw(inst);
    }

    /// Load from `[Xn, Xm]`, or `[Xn, Xm, LSL #size]` when `scaled`.
    pub fn ldr_reg(&mut self, access: Access, rt: u8, rn: Reg, rm: Reg, scaled: bool) {
        let inst = rrr(access.load().1, rt, rn.code(), rm.code()) | ((scaled as u32) << 12);
        self.emit_raw(inst);
    }

    pub fn str_reg(&mut self, access: Access, rt: u8, rn: Reg, rm: Reg, scaled: bool) {
        let inst = rrr(access.store().1, rt, rn.code(), rm.code()) | ((scaled as u32) << 12);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm12] (store 64-bit, unsigned offset)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 00ii iiii iiii iinn nnnt tttt
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9000000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn], #imm9 (store with post-increment)
    pub fn str_post(&mut self, rt: Reg, rn: Reg, imm9: i16) {
        let inst = 0xF8000400
            | (((imm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Xt, literal; returns the instruction offset.
    pub fn ldr_literal(&mut self, rt: Reg) -> usize {
        let at = self.offset();
        self.emit_raw(0x58000000 | rt.code() as u32);
        at
    }

    /// LDR Dt, literal; returns the instruction offset.
    pub fn ldr_literal_d(&mut self, rt: u8) -> usize {
        let at = self.offset();
        self.emit_raw(0x5C000000 | (rt as u32 & 31));
        at
    }

    // ==================== Branches ====================

    /// B label (unconditional branch)
    pub fn b(&mut self, offset: i32) -> usize {
        // 0001 01ii iiii iiii iiii iiii iiii iiii
        let at = self.offset();
        self.emit_raw(0x14000000 | (((offset >> 2) as u32) & 0x03FFFFFF));
        at
    }

    /// B.cond label (conditional branch)
    pub fn b_cond(&mut self, cond: Cond, offset: i32) -> usize {
        // 0101 0100 iiii iiii iiii iiii iii0 cccc
        let at = self.offset();
        self.emit_raw(0x54000000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | (cond as u32));
        at
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }

    /// BLR Xn (branch and link to register)
    pub fn blr(&mut self, rn: Reg) {
        // 1101 0110 0011 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD63F0000 | ((rn.code() as u32) << 5));
    }

    // ==================== Stack operations ====================

    /// STP X1, X2, [SP, #imm]! (store pair with pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA9800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP X1, X2, [SP], #imm (load pair with post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C00000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Floating Point ====================

    fn fp_rrr(&mut self, base: u32, rd: u8, rn: u8, rm: u8) {
        self.emit_raw(rrr(base, rd, rn, rm));
    }

    /// FADD Dd, Dn, Dm
    pub fn fadd(&mut self, rd: u8, rn: u8, rm: u8) {
        self.fp_rrr(0x1E602800, rd, rn, rm);
    }

    pub fn fsub(&mut self, rd: u8, rn: u8, rm: u8) {
        self.fp_rrr(0x1E603800, rd, rn, rm);
    }

    pub fn fmul(&mut self, rd: u8, rn: u8, rm: u8) {
        self.fp_rrr(0x1E600800, rd, rn, rm);
    }

    pub fn fdiv(&mut self, rd: u8, rn: u8, rm: u8) {
        self.fp_rrr(0x1E601800, rd, rn, rm);
    }

    /// FCMP Dn, Dm
    pub fn fcmp(&mut self, rn: u8, rm: u8) {
        self.fp_rrr(0x1E602000, 0, rn, rm);
    }

    /// SCVTF Dd, Xn
    pub fn scvtf(&mut self, rd: u8, rn: Reg) {
        self.fp_rrr(0x9E620000, rd, rn.code(), 0);
    }

    /// FCVTZS Xd, Dn (saturating, NaN gives 0)
    pub fn fcvtzs(&mut self, rd: Reg, rn: u8) {
        self.fp_rrr(0x9E780000, rd.code(), rn, 0);
    }

    // ==================== NOP ====================

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.emit_raw(0xD503201F);
    }
}
