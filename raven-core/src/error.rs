//! Fault and filesystem error types.

use thiserror::Error;

/// Runtime faults. Fiber-local: a fault transitions the fiber to
/// `Faulted`, writes a diagnostic to the owning connection (if any) and
/// closes it. The process never crashes on one.
#[derive(Debug, Clone, Error)]
pub enum VmFault {
    /// Message lookup failed on the receiver's blueprint chain and the
    /// builtin registry.
    #[error("message `{message}` not understood by {receiver}")]
    UnknownMessage { message: String, receiver: String },

    /// Operand kinds unusable for the attempted operation.
    #[error("type mismatch: cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("constant pool index {index} out of range")]
    ConstantOutOfRange { index: u32 },

    #[error("invalid bytecode at offset {offset}")]
    InvalidBytecode { offset: usize },

    #[error("operand stack overflow")]
    StackOverflow,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("call depth limit exceeded")]
    CallDepthExceeded,

    #[error("wrong number of arguments to `{message}`: expected {expected}, got {got}")]
    ArityMismatch {
        message: String,
        expected: u16,
        got: usize,
    },

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("`{builtin}` expects {expected}, got {got}")]
    BadArgument {
        builtin: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("member slot {index} out of range")]
    MemberOutOfRange { index: u32 },

    /// `self` is not an instance, but the bytecode touched a member slot.
    #[error("current self has no member slots")]
    NoSelfObject,

    /// A blocking I/O primitive ran on a fiber with no connection.
    #[error("no connection bound to this fiber")]
    NoConnection,

    /// A handle referenced a heap slot that is gone. Indicates an engine
    /// bug (a missed GC root), never a script bug.
    #[error("stale heap handle")]
    StaleHandle,
}

/// Virtual filesystem errors.
#[derive(Debug, Clone, Error)]
pub enum VfsError {
    #[error("file name `{0}` is empty or contains `/`")]
    InvalidName(String),

    #[error("duplicate file name `{0}` among siblings")]
    DuplicateName(String),

    #[error("unknown file node")]
    UnknownNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display() {
        let fault = VmFault::UnknownMessage {
            message: "greet".to_string(),
            receiver: "object".to_string(),
        };
        assert!(fault.to_string().contains("greet"));

        let fault = VmFault::ArityMismatch {
            message: "login".to_string(),
            expected: 0,
            got: 2,
        };
        assert!(fault.to_string().contains("expected 0"));
    }
}
