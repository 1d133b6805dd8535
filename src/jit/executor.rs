//! Trampoline from the VM invocation convention into compiled code.

use tracing::trace;

use super::codebuf::ErrorKind;
use super::compiler::NativeCode;
use crate::vm::{Method, RuntimeFault, StackRef, Vm};

/// Native signature of a compiled method. Returns 0 or a trap sentinel.
pub type JitFn = unsafe extern "C" fn(
    cls_id: i64,
    mthd_id: i64,
    class_mem: *mut u64,
    inst: *mut u64,
    op_stack: *mut u64,
    stack_pos: *mut i64,
    call_stack: *const Vm,
    call_stack_pos: *mut i64,
) -> i64;

/// Map a native status to the fault it stands for.
pub fn status_fault(status: i64, method: &Method) -> Result<(), RuntimeFault> {
    let name = || method.full_name.clone();
    match ErrorKind::from_sentinel(status) {
        None if status == 0 => Ok(()),
        Some(ErrorKind::NilDeref) => Err(RuntimeFault::NilDeref { method: name() }),
        Some(ErrorKind::ArrayUnderflow) => Err(RuntimeFault::IndexUnderflow { method: name() }),
        Some(ErrorKind::ArrayOverflow) => Err(RuntimeFault::IndexOverflow { method: name() }),
        Some(ErrorKind::DivideByZero) => Err(RuntimeFault::DivideByZero { method: name() }),
        Some(ErrorKind::StackOverflow) => Err(RuntimeFault::StackOverflow),
        Some(ErrorKind::StackUnderflow) => Err(RuntimeFault::StackUnderflow),
        Some(ErrorKind::ShapeMismatch) => Err(RuntimeFault::ArrayShapeMismatch { method: name() }),
        None => crate::vm::fatal(format!(
            "native code of {} returned unknown status {status}",
            method.full_name
        )),
    }
}

/// Run `code` for `method` on the caller's operand stack.
pub fn execute(
    vm: &Vm,
    method: &Method,
    code: &NativeCode,
    inst: u64,
    stack: StackRef,
    depth: &mut i64,
) -> Result<(), RuntimeFault> {
    let entry = code.entry();
    let class_mem = vm.class_memory(method.class_id);
    trace!(target: "stackjit::jit", method = %method.full_name, depth = *depth, "enter native");

    // SAFETY: the entry was produced for this method by the host backend and
    // every pointer stays valid for the duration of the call.
    let status = unsafe {
        entry(
            method.class_id as i64,
            method.id as i64,
            class_mem,
            inst as *mut u64,
            stack.base(),
            stack.pos_ptr(),
            vm as *const Vm,
            depth as *mut i64,
        )
    };
    status_fault(status, method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let m = Method::new("m", 0, 0, vec![]);
        assert!(status_fault(0, &m).is_ok());
        assert!(matches!(status_fault(-1, &m), Err(RuntimeFault::NilDeref { .. })));
        assert!(matches!(status_fault(-2, &m), Err(RuntimeFault::IndexUnderflow { .. })));
        assert!(matches!(status_fault(-3, &m), Err(RuntimeFault::IndexOverflow { .. })));
        assert!(matches!(status_fault(-4, &m), Err(RuntimeFault::DivideByZero { .. })));
        assert_eq!(status_fault(-5, &m), Err(RuntimeFault::StackOverflow));
        assert_eq!(status_fault(-6, &m), Err(RuntimeFault::StackUnderflow));
        assert_eq!(
            status_fault(-7, &m),
            Err(RuntimeFault::ArrayShapeMismatch { method: m.full_name.clone() })
        );
    }
}
