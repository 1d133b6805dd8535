//! Native frame layout of a compiled method.
//!
//! ```text
//!   fp + 16 ..        stack-passed arguments (x86-64 only)
//!   fp - 8  .. - 64   header: incoming arguments, see `slots`
//!   fp - 72 ..        spill area for caller-saved registers
//!   below             locals, one word each
//! ```

use std::collections::BTreeSet;

use super::error::CompileError;
use crate::vm::{MemoryContext, Method};

pub const WORD: i32 = 8;

/// Header slots holding the native arguments.
pub mod slots {
    pub const CLS_ID: i32 = -8;
    pub const MTHD_ID: i32 = -16;
    pub const CLASS_MEM: i32 = -24;
    pub const INSTANCE_MEM: i32 = -32;
    pub const OP_STACK: i32 = -40;
    pub const STACK_POS: i32 = -48;
    pub const CALL_STACK: i32 = -56;
    pub const CALL_STACK_POS: i32 = -64;

    pub const HEADER_SIZE: i32 = 64;
}

/// Largest frame any backend can address with a single immediate.
pub const MAX_FRAME_SIZE: usize = 4080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// (local id, fp offset), sorted by id
    locals: Vec<(i64, i32)>,
    spill_slots: usize,
    size: i32,
}

impl FrameLayout {
    /// Lay out the frame from the variable references in `method`.
    pub fn build(method: &Method, spill_slots: usize) -> Result<Self, CompileError> {
        let ids: BTreeSet<i64> = method
            .code
            .iter()
            .filter_map(|op| op.variable())
            .filter(|(_, ctx)| *ctx == MemoryContext::Local)
            .map(|(id, _)| id)
            .collect();

        let locals_base = slots::HEADER_SIZE + spill_slots as i32 * WORD;
        let locals = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, -(locals_base + (i as i32 + 1) * WORD)))
            .collect::<Vec<_>>();

        let used = locals_base as usize + locals.len() * WORD as usize;
        let size = (used + 15) & !15;
        if size > MAX_FRAME_SIZE {
            return Err(CompileError::FrameTooLarge(size));
        }

        Ok(Self {
            locals,
            spill_slots,
            size: size as i32,
        })
    }

    pub fn local(&self, id: i64) -> Option<i32> {
        self.locals
            .binary_search_by_key(&id, |(local, _)| *local)
            .ok()
            .map(|i| self.locals[i].1)
    }

    /// Offset of an instance or class member from the object pointer.
    pub fn member(id: i64) -> i32 {
        id as i32 * WORD
    }

    pub fn spill_slot(&self, index: usize) -> i32 {
        debug_assert!(index < self.spill_slots);
        -(slots::HEADER_SIZE + (index as i32 + 1) * WORD)
    }

    pub fn spill_slots(&self) -> usize {
        self.spill_slots
    }

    /// Bytes reserved below the frame pointer, 16-byte aligned.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Lowest offset and word count of the area zeroed on entry
    /// (spill slots and locals).
    pub fn zeroed_area(&self) -> (i32, usize) {
        let words = self.spill_slots + self.locals.len();
        (-(slots::HEADER_SIZE + words as i32 * WORD), words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Method, Op};

    fn method(code: Vec<Op>) -> Method {
        Method::new("m", 0, 8, code)
    }

    #[test]
    fn test_locals_follow_spill_area() {
        let m = method(vec![
            Op::LoadIntVar { id: 3, ctx: MemoryContext::Local },
            Op::StorIntVar { id: 0, ctx: MemoryContext::Local },
            Op::LoadIntVar { id: 5, ctx: MemoryContext::Instance },
            Op::Rtrn,
        ]);
        let frame = FrameLayout::build(&m, 2).unwrap();
        assert_eq!(frame.spill_slot(0), -72);
        assert_eq!(frame.spill_slot(1), -80);
        assert_eq!(frame.local(0), Some(-88));
        assert_eq!(frame.local(3), Some(-96));
        assert_eq!(frame.local(5), None);
        assert_eq!(frame.size(), 96);
        assert_eq!(frame.zeroed_area(), (-96, 4));
        assert_eq!(FrameLayout::member(5), 40);
    }

    #[test]
    fn test_frame_too_large() {
        let code = (0..600)
            .map(|id| Op::StorIntVar { id, ctx: MemoryContext::Local })
            .collect();
        assert!(matches!(
            FrameLayout::build(&method(code), 0),
            Err(CompileError::FrameTooLarge(_))
        ));
    }
}
