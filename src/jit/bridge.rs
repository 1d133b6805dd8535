//! Runtime callback bridge.
//!
//! Compiled code calls [`jit_stack_callback`] for every instruction it does
//! not translate inline. Arguments are already on the VM operand stack; the
//! callback runs the same runtime service the interpreter uses and leaves
//! any result on the operand stack for the native code to pop.

use tracing::trace;

use crate::vm::runtime::{self, OpContext};
use crate::vm::{Op, StackRef, Vm, report_and_exit};

/// Identifier of a bridged operation, passed as the first callback argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum CallbackOp {
    MthdCall = 0,
    DynMthdCall = 1,
    AsyncMthdCall = 2,
    NewAry = 3,
    NewObjInst = 4,
    LoadArySize = 5,
    CpyAry = 6,
    ZeroAry = 7,
    I2S = 8,
    F2S = 9,
    S2I = 10,
    S2F = 11,
    ObjTypeOf = 12,
    ObjInstCast = 13,
    ThreadJoin = 14,
    ThreadSleep = 15,
    ThreadMutex = 16,
    CriticalStart = 17,
    CriticalEnd = 18,
    RandFloat = 19,
    Trap = 20,
    TrapRtrn = 21,
}

impl CallbackOp {
    /// The bridge operation for `op`, or `None` if it is translated inline.
    pub fn of(op: &Op) -> Option<Self> {
        Some(match op {
            Op::MthdCall { .. } => CallbackOp::MthdCall,
            Op::DynMthdCall { .. } => CallbackOp::DynMthdCall,
            Op::AsyncMthdCall { .. } => CallbackOp::AsyncMthdCall,
            Op::NewAry { .. } => CallbackOp::NewAry,
            Op::NewObjInst { .. } => CallbackOp::NewObjInst,
            Op::LoadArySize => CallbackOp::LoadArySize,
            Op::CpyAry { .. } => CallbackOp::CpyAry,
            Op::ZeroAry { .. } => CallbackOp::ZeroAry,
            Op::I2S => CallbackOp::I2S,
            Op::F2S => CallbackOp::F2S,
            Op::S2I => CallbackOp::S2I,
            Op::S2F => CallbackOp::S2F,
            Op::ObjTypeOf { .. } => CallbackOp::ObjTypeOf,
            Op::ObjInstCast { .. } => CallbackOp::ObjInstCast,
            Op::ThreadJoin => CallbackOp::ThreadJoin,
            Op::ThreadSleep => CallbackOp::ThreadSleep,
            Op::ThreadMutex => CallbackOp::ThreadMutex,
            Op::CriticalStart => CallbackOp::CriticalStart,
            Op::CriticalEnd => CallbackOp::CriticalEnd,
            Op::RandFloat => CallbackOp::RandFloat,
            Op::Trap { .. } => CallbackOp::Trap,
            Op::TrapRtrn { .. } => CallbackOp::TrapRtrn,
            _ => return None,
        })
    }
}

/// Address compiled code calls into.
pub fn dispatcher_address() -> usize {
    jit_stack_callback as *const () as usize
}

/// Entry point for bridged instructions.
///
/// `instr` points at the instruction inside the method's code, which lives
/// as long as the program. `call_stack` is the running [`Vm`] and
/// `call_stack_pos` its current call depth. Faults end the process.
#[allow(clippy::too_many_arguments)]
pub extern "C" fn jit_stack_callback(
    op_id: i64,
    instr: *const Op,
    cls_id: i64,
    mthd_id: i64,
    inst: *mut u64,
    op_stack: *mut u64,
    stack_pos: *mut i64,
    call_stack: *const Vm,
    call_stack_pos: *mut i64,
    ip: i64,
) {
    // SAFETY: compiled code passes the pointers it was entered with; the
    // program, the VM and the operand stack outlive the native frame.
    let (vm, op, depth) = unsafe { (&*call_stack, &*instr, &mut *call_stack_pos) };
    let stack = unsafe { StackRef::from_raw(op_stack, stack_pos, vm.config().op_stack_size) };
    debug_assert_eq!(CallbackOp::of(op).map(|c| c as i64), Some(op_id));
    trace!(target: "stackjit::jit", op = op.name(), ip, cls_id, mthd_id, "bridge call");

    let mut ctx = OpContext {
        vm,
        cls_id: cls_id as usize,
        mthd_id: mthd_id as usize,
        inst: inst as u64,
        stack,
        depth,
    };
    if let Err(fault) = runtime::execute(op, &mut ctx) {
        report_and_exit(&fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ElementKind, ReturnType};

    #[test]
    fn test_inline_ops_are_not_bridged() {
        assert_eq!(CallbackOp::of(&Op::AddInt), None);
        assert_eq!(
            CallbackOp::of(&Op::LoadAryElm { kind: ElementKind::Int, dims: 1 }),
            None
        );
    }

    #[test]
    fn test_bridge_ids_are_stable() {
        assert_eq!(CallbackOp::of(&Op::MthdCall { cls: 0, mthd: 0 }), Some(CallbackOp::MthdCall));
        assert_eq!(
            CallbackOp::of(&Op::DynMthdCall { params: 1, rtrn: ReturnType::Int }).map(|c| c as i64),
            Some(1)
        );
        assert_eq!(CallbackOp::TrapRtrn as i64, 21);
        assert_ne!(dispatcher_address(), 0);
    }
}
