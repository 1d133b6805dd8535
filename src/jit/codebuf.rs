//! Code buffer and fixup tables.
//!
//! Translation appends machine code to a [`CodeBuffer`] and records every
//! location that cannot be encoded yet as a [`Fixup`]: jumps to labels,
//! references into the constant pool and branches into the trap entries.
//! Offsets are absolute positions in the buffer, so they stay valid while the
//! buffer grows. [`CodeBuffer::resolve`] patches all of them in one pass once
//! the whole method body is emitted.

use std::collections::HashMap;

use super::emitter::Emitter;
use super::error::CompileError;

/// Target of a jump fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// A `Lbl` pseudo-instruction in the bytecode.
    Bytecode(i64),
}

/// Runtime check that leaves the method through a trap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NilDeref,
    ArrayUnderflow,
    ArrayOverflow,
    DivideByZero,
    StackOverflow,
    StackUnderflow,
    /// The array's dimension count differs from the instruction's.
    ShapeMismatch,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::NilDeref,
        ErrorKind::ArrayUnderflow,
        ErrorKind::ArrayOverflow,
        ErrorKind::DivideByZero,
        ErrorKind::StackOverflow,
        ErrorKind::StackUnderflow,
        ErrorKind::ShapeMismatch,
    ];

    /// Status returned by the compiled method when the trap fires.
    pub fn sentinel(self) -> i64 {
        match self {
            ErrorKind::NilDeref => -1,
            ErrorKind::ArrayUnderflow => -2,
            ErrorKind::ArrayOverflow => -3,
            ErrorKind::DivideByZero => -4,
            ErrorKind::StackOverflow => -5,
            ErrorKind::StackUnderflow => -6,
            ErrorKind::ShapeMismatch => -7,
        }
    }

    pub fn from_sentinel(status: i64) -> Option<Self> {
        ErrorKind::ALL.into_iter().find(|k| k.sentinel() == status)
    }
}

/// A literal that lives in the constant pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

impl Constant {
    /// Pool entries are shared by exact bit pattern.
    fn bits(self) -> u64 {
        match self {
            Constant::Int(v) => v as u64,
            Constant::Float(v) => v.to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixupKind {
    Jump(Label),
    Constant(Constant),
    ErrorBranch(ErrorKind),
}

/// A hole in the emitted code. `offset` is the anchor the architecture's
/// patch routine understands (displacement field on x86-64, instruction word
/// on AArch64).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fixup {
    pub offset: usize,
    pub kind: FixupKind,
}

/// A fixup after resolution, kept for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedFixup {
    pub offset: usize,
    pub kind: FixupKind,
    /// Code offset the patched instruction now refers to.
    pub target: usize,
}

/// A buffer for building machine code.
#[derive(Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: HashMap<Label, usize>,
    traps: HashMap<ErrorKind, usize>,
    fixups: Vec<Fixup>,
}

/// Finished code: the method body followed by its constant pool.
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Body and pool, ready to be copied into executable memory.
    pub bytes: Vec<u8>,
    /// Length of the executable part.
    pub code_len: usize,
    pub int_constants: Vec<i64>,
    pub float_constants: Vec<f64>,
    pub fixups: Vec<ResolvedFixup>,
    pub traps: HashMap<ErrorKind, usize>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current position, usable as a fixup anchor.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Bind `label` to the current position.
    pub fn define_label(&mut self, label: Label) {
        self.labels.insert(label, self.code.len());
    }

    pub fn label(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Bind the trap entry for `kind` to the current position.
    pub fn define_trap(&mut self, kind: ErrorKind) {
        self.traps.insert(kind, self.code.len());
    }

    pub fn trap(&self, kind: ErrorKind) -> Option<usize> {
        self.traps.get(&kind).copied()
    }

    pub fn add_fixup(&mut self, offset: usize, kind: FixupKind) {
        self.fixups.push(Fixup { offset, kind });
    }

    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Pad with `fill` up to the given power-of-two boundary.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, fill);
    }

    /// Resolve every fixup and append the constant pool.
    ///
    /// Jumps and error branches are patched first, then constants are
    /// deduplicated by bit pattern (ints before floats) into an 8-byte aligned
    /// pool placed right after the code.
    pub fn resolve<E: Emitter>(self) -> Result<Assembly, CompileError> {
        let CodeBuffer {
            mut code,
            labels,
            traps,
            fixups,
        } = self;
        let code_len = code.len();
        let mut resolved = Vec::with_capacity(fixups.len());

        let mut int_constants: Vec<i64> = Vec::new();
        let mut float_constants: Vec<f64> = Vec::new();
        let mut pending_constants = Vec::new();

        for fixup in &fixups {
            let target = match fixup.kind {
                FixupKind::Jump(label) => labels
                    .get(&label)
                    .copied()
                    .ok_or(CompileError::UndefinedLabel(label))?,
                FixupKind::ErrorBranch(kind) => traps
                    .get(&kind)
                    .copied()
                    .ok_or(CompileError::MissingTrap(kind))?,
                FixupKind::Constant(constant) => {
                    match constant {
                        Constant::Int(v) => {
                            if !int_constants.contains(&v) {
                                int_constants.push(v);
                            }
                        }
                        Constant::Float(v) => {
                            if !float_constants.iter().any(|c| c.to_bits() == v.to_bits()) {
                                float_constants.push(v);
                            }
                        }
                    }
                    pending_constants.push(*fixup);
                    continue;
                }
            };
            E::patch_branch(&mut code, fixup.offset, target)?;
            resolved.push(ResolvedFixup {
                offset: fixup.offset,
                kind: fixup.kind,
                target,
            });
        }

        let count = int_constants.len() + float_constants.len();
        if count > E::MAX_CONSTANTS {
            return Err(CompileError::ConstantPoolOverflow {
                count,
                limit: E::MAX_CONSTANTS,
            });
        }

        let pool_start = (code_len + 7) & !7;
        code.resize(pool_start, 0);
        for v in &int_constants {
            code.extend_from_slice(&v.to_le_bytes());
        }
        for v in &float_constants {
            code.extend_from_slice(&v.to_bits().to_le_bytes());
        }

        for fixup in pending_constants {
            let FixupKind::Constant(constant) = fixup.kind else {
                continue;
            };
            let slot = match constant {
                Constant::Int(_) => int_constants
                    .iter()
                    .position(|c| *c as u64 == constant.bits()),
                Constant::Float(_) => float_constants
                    .iter()
                    .position(|c| c.to_bits() == constant.bits())
                    .map(|i| int_constants.len() + i),
            };
            let Some(slot) = slot else {
                continue;
            };
            let target = pool_start + slot * 8;
            E::patch_constant(&mut code, fixup.offset, target)?;
            resolved.push(ResolvedFixup {
                offset: fixup.offset,
                kind: fixup.kind,
                target,
            });
        }

        Ok(Assembly {
            bytes: code,
            code_len,
            int_constants,
            float_constants,
            fixups: resolved,
            traps,
        })
    }
}

/// Read a little-endian word for in-place patching.
pub(crate) fn read_u32(code: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&code[at..at + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u32(code: &mut [u8], at: usize, value: u32) {
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::emit_x86_64::X86_64Emitter;

    fn rel32_at(code: &[u8], at: usize) -> i64 {
        read_u32(code, at) as i32 as i64
    }

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.align(8, 0xCC);

        assert_eq!(buf.len(), 8);
        assert_eq!(buf.code()[7], 0xCC);
    }

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut buf = CodeBuffer::new();
        buf.define_label(Label::Bytecode(1));
        buf.emit_u8(0xE9);
        let back = buf.offset();
        buf.emit_u32(0);
        buf.add_fixup(back, FixupKind::Jump(Label::Bytecode(1)));

        buf.emit_u8(0xE9);
        let fwd = buf.offset();
        buf.emit_u32(0);
        buf.add_fixup(fwd, FixupKind::Jump(Label::Bytecode(2)));
        // Far enough that an 8-bit displacement would not do.
        buf.emit_bytes(&[0x90; 300]);
        buf.define_label(Label::Bytecode(2));

        let asm = buf.resolve::<X86_64Emitter>().unwrap();
        assert_eq!(rel32_at(&asm.bytes, back), 0 - (back as i64 + 4));
        assert_eq!(rel32_at(&asm.bytes, fwd), 310 - (fwd as i64 + 4));
        for fixup in &asm.fixups {
            let landed = fixup.offset as i64 + 4 + rel32_at(&asm.bytes, fixup.offset);
            assert_eq!(landed as usize, fixup.target);
        }
    }

    #[test]
    fn test_undefined_label() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.add_fixup(0, FixupKind::Jump(Label::Bytecode(9)));
        assert!(matches!(
            buf.resolve::<X86_64Emitter>(),
            Err(CompileError::UndefinedLabel(Label::Bytecode(9)))
        ));
    }

    #[test]
    fn test_error_branch_targets_trap() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.add_fixup(0, FixupKind::ErrorBranch(ErrorKind::ArrayOverflow));
        buf.emit_bytes(&[0x90; 4]);
        buf.define_trap(ErrorKind::ArrayOverflow);
        buf.emit_u8(0xC3);

        let asm = buf.resolve::<X86_64Emitter>().unwrap();
        assert_eq!(asm.fixups[0].target, 8);
        assert_eq!(rel32_at(&asm.bytes, 0), 4);
    }

    #[test]
    fn test_constant_pool_dedup() {
        let mut buf = CodeBuffer::new();
        for value in [1.5f64, 2.5, 1.5] {
            let at = buf.offset();
            buf.emit_u32(0);
            buf.add_fixup(at, FixupKind::Constant(Constant::Float(value)));
        }
        let at = buf.offset();
        buf.emit_u32(0);
        buf.add_fixup(at, FixupKind::Constant(Constant::Int(1 << 40)));

        let asm = buf.resolve::<X86_64Emitter>().unwrap();
        assert_eq!(asm.int_constants, vec![1 << 40]);
        assert_eq!(asm.float_constants, vec![1.5, 2.5]);
        // pool starts at 16: int slot, then the two floats
        assert_eq!(asm.bytes.len(), 16 + 3 * 8);
        let first = asm.fixups.iter().find(|f| f.offset == 0).unwrap();
        let third = asm.fixups.iter().find(|f| f.offset == 8).unwrap();
        assert_eq!(first.target, third.target);
        assert_eq!(first.target, 24);
    }

    #[test]
    fn test_negative_zero_is_distinct() {
        let mut buf = CodeBuffer::new();
        for value in [0.0f64, -0.0] {
            let at = buf.offset();
            buf.emit_u32(0);
            buf.add_fixup(at, FixupKind::Constant(Constant::Float(value)));
        }
        let asm = buf.resolve::<X86_64Emitter>().unwrap();
        assert_eq!(asm.float_constants.len(), 2);
    }

    #[test]
    fn test_constant_pool_overflow() {
        let mut buf = CodeBuffer::new();
        for i in 0..(X86_64Emitter::MAX_CONSTANTS + 1) {
            let at = buf.offset();
            buf.emit_u32(0);
            buf.add_fixup(at, FixupKind::Constant(Constant::Float(i as f64)));
        }
        assert!(matches!(
            buf.resolve::<X86_64Emitter>(),
            Err(CompileError::ConstantPoolOverflow { .. })
        ));
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(ErrorKind::NilDeref.sentinel(), -1);
        assert_eq!(ErrorKind::from_sentinel(-3), Some(ErrorKind::ArrayOverflow));
        assert_eq!(ErrorKind::from_sentinel(-6), Some(ErrorKind::StackUnderflow));
        assert_eq!(ErrorKind::from_sentinel(0), None);
        assert_eq!(ErrorKind::from_sentinel(-8), None);
        let mut seen: Vec<i64> = ErrorKind::ALL.iter().map(|k| k.sentinel()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), ErrorKind::ALL.len());
    }
}
