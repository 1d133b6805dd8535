use thiserror::Error;
use tracing::error;

/// A fault raised while running a program. Faults are not recoverable by
/// the program; the CLI reports them and exits with status 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("Attempting to dereference a 'Nil' memory instance in '{method}'")]
    NilDeref { method: String },

    #[error("Index out of bounds (underflow) in '{method}'")]
    IndexUnderflow { method: String },

    #[error("Index out of bounds (overflow) in '{method}'")]
    IndexOverflow { method: String },

    #[error("Array shape mismatch in '{method}'")]
    ArrayShapeMismatch { method: String },

    #[error("Attempted to divide by zero in '{method}'")]
    DivideByZero { method: String },

    #[error("Invalid object cast: '{from}' to '{to}'")]
    InvalidCast { from: String, to: String },

    #[error("Invalid array size {size}")]
    InvalidArraySize { size: i64 },

    #[error("Call depth of {depth} exceeded")]
    CallDepthExceeded { depth: i64 },

    #[error("Operand stack overflow")]
    StackOverflow,

    #[error("Operand stack underflow")]
    StackUnderflow,

    #[error("Invalid thread id {id}")]
    InvalidThread { id: i64 },

    #[error("Invalid system trap {0}")]
    InvalidTrap(i64),

    #[error("Unknown method {0}")]
    UnknownMethod(String),
}

/// Report a runtime fault and end the process.
pub fn report_and_exit(fault: &RuntimeFault) -> ! {
    error!(%fault, "runtime fault");
    eprintln!("{fault}");
    std::process::exit(1)
}

/// A contract violation in the runtime or a compiled method. Loaded
/// programs are verified, so reaching this is a bug.
pub fn fatal(message: impl AsRef<str>) -> ! {
    let message = message.as_ref();
    error!(message, "fatal");
    eprintln!("fatal: {message}");
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let fault = RuntimeFault::NilDeref {
            method: "Main:run".into(),
        };
        assert_eq!(
            fault.to_string(),
            "Attempting to dereference a 'Nil' memory instance in 'Main:run'"
        );
        let cast = RuntimeFault::InvalidCast {
            from: "Dog".into(),
            to: "Car".into(),
        };
        assert!(cast.to_string().contains("'Dog' to 'Car'"));
    }
}
