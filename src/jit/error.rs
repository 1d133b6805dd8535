use thiserror::Error;

use super::codebuf::{ErrorKind, Label};
use super::memory::MemoryError;

/// A soft failure: the method is abandoned and stays interpreted.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("register pools exhausted")]
    RegistersExhausted,

    #[error("constant pool overflow: {count} distinct constants, limit is {limit}")]
    ConstantPoolOverflow { count: usize, limit: usize },

    #[error("branch displacement {0} out of range")]
    BranchOutOfRange(i64),

    #[error("jump to undefined label {0:?}")]
    UndefinedLabel(Label),

    #[error("trap entry for {0:?} was never emitted")]
    MissingTrap(ErrorKind),

    #[error("frame of {0} bytes is too large")]
    FrameTooLarge(usize),

    #[error("executable memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("no code generator for this architecture")]
    Unsupported,
}
