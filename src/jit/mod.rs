//! Method-level JIT compilation.
//!
//! - `regalloc`, `stack` and `frame`: compile-time state of one method
//! - `translator`: bytecode to machine code over the [`Emitter`] seam
//! - `x86_64`/`aarch64`: instruction encoders, `emit_*`: their emitters
//! - `codebuf`: code buffer, labels, fixups and the constant pool
//! - `memory`: executable page manager
//! - `bridge` and `executor`: crossing between native code and the VM
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod aarch64;
pub mod bridge;
pub mod codebuf;
pub mod compiler;
pub mod emit_aarch64;
pub mod emit_x86_64;
pub mod emitter;
mod error;
pub mod executor;
pub mod frame;
pub mod memory;
pub mod regalloc;
pub mod stack;
pub mod translator;
pub mod x86_64;

pub use compiler::{Arch, JitCompiler, NativeCode, translate};
pub use emitter::Emitter;
pub use error::CompileError;
pub use translator::{CodegenStats, Translation};
