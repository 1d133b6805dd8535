//! JIT compiler for stack bytecode methods.
//!
//! Ties translation, fixup resolution and the page manager together. A
//! [`JitCompiler`] is shared by every thread of a VM; only the page manager
//! is locked, translation runs unsynchronized on the calling thread.

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use super::emit_aarch64::AArch64Emitter;
use super::emit_x86_64::X86_64Emitter;
use super::emitter::Emitter;
use super::error::CompileError;
use super::executor::JitFn;
use super::memory::PageManager;
use super::translator::{CodegenStats, Translation, Translator};
use crate::vm::{Method, Program};

/// Target architecture of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    AArch64,
}

impl Arch {
    /// The architecture compiled code can run on, if supported.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::AArch64)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => X86_64Emitter::NAME,
            Arch::AArch64 => AArch64Emitter::NAME,
        }
    }
}

/// Translate `method` for `arch` without installing it.
pub fn translate(arch: Arch, program: &Program, method: &Method) -> Result<Translation, CompileError> {
    match arch {
        Arch::X86_64 => Translator::<X86_64Emitter>::new(program, method)?.translate(),
        Arch::AArch64 => Translator::<AArch64Emitter>::new(program, method)?.translate(),
    }
}

/// Installed machine code of one method.
#[derive(Debug)]
pub struct NativeCode {
    entry: NonNull<u8>,
    len: usize,
    pub int_constants: Vec<i64>,
    pub float_constants: Vec<f64>,
    pub stats: CodegenStats,
}

// The code is immutable once installed and never unmapped.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

impl NativeCode {
    pub fn entry(&self) -> JitFn {
        // SAFETY: `entry` is the start of a method body emitted for the
        // host with the `JitFn` calling convention.
        unsafe { std::mem::transmute::<*const u8, JitFn>(self.entry.as_ptr()) }
    }

    pub fn address(&self) -> usize {
        self.entry.as_ptr() as usize
    }

    /// Bytes installed, constant pool included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct JitCompiler {
    arch: Arch,
    pages: Mutex<PageManager>,
    compiled: AtomicUsize,
    failed: AtomicUsize,
}

impl JitCompiler {
    /// A compiler for the host, or `Unsupported` on other architectures.
    pub fn new() -> Result<Self, CompileError> {
        let arch = Arch::host().ok_or(CompileError::Unsupported)?;
        Ok(Self {
            arch,
            pages: Mutex::new(PageManager::new()?),
            compiled: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Translate and install `method`.
    pub fn compile(&self, program: &Program, method: &Method) -> Result<NativeCode, CompileError> {
        let result = self.compile_inner(program, method);
        match &result {
            Ok(code) => {
                self.compiled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "stackjit::jit",
                    method = %method.full_name,
                    bytes = code.len(),
                    address = format_args!("{:#x}", code.address()),
                    "compiled"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "stackjit::jit",
                    method = %method.full_name,
                    error = %e,
                    "compilation failed, staying interpreted"
                );
            }
        }
        result
    }

    fn compile_inner(&self, program: &Program, method: &Method) -> Result<NativeCode, CompileError> {
        let Translation { assembly, stats, .. } = translate(self.arch, program, method)?;
        let entry = self
            .pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .install(&assembly.bytes)?;
        Ok(NativeCode {
            entry,
            len: assembly.bytes.len(),
            int_constants: assembly.int_constants,
            float_constants: assembly.float_constants,
            stats,
        })
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Class, MemoryContext, Op, ReturnType};

    fn program() -> Program {
        let m = Method::new(
            "twice",
            1,
            1,
            vec![
                Op::StorIntVar { id: 0, ctx: MemoryContext::Local },
                Op::LoadIntVar { id: 0, ctx: MemoryContext::Local },
                Op::LoadIntLit { value: 2 },
                Op::MulInt,
                Op::Rtrn,
            ],
        )
        .returns(ReturnType::Int);
        Program::new(vec![Class::new("Main", 0, 0, vec![m])], (0, 0))
    }

    #[test]
    fn test_both_backends_translate() {
        let p = program();
        let m = p.method(0, 0).unwrap();
        for arch in [Arch::X86_64, Arch::AArch64] {
            let t = translate(arch, &p, m).unwrap();
            assert!(t.assembly.code_len > 0);
            assert!(t.pools_returned);
        }
    }

    #[test]
    fn test_compile_installs_code() {
        let Ok(jit) = JitCompiler::new() else {
            return;
        };
        let p = program();
        let code = jit.compile(&p, p.method(0, 0).unwrap()).unwrap();
        assert!(!code.is_empty());
        assert_eq!(jit.compiled_count(), 1);
        assert_eq!(jit.failed_count(), 0);
    }
}
