//! stackjit - a method-level JIT for a stack bytecode VM
//!
//! Methods start out interpreted. Once a method is hot it is translated to
//! x86-64 or AArch64 machine code, installed in executable pages, and called
//! directly from then on. Compiled code reaches back into the VM for calls,
//! allocation and other services through a single callback entry point.

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

pub use config::{JitMode, RuntimeConfig};
pub use vm::{Program, RuntimeFault, Vm};
