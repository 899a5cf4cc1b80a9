/// Lunar host-facing error types.
///
/// Errors raised *inside* the guest language are plain TaggedValues thrown
/// through the pcall/xpcall frame walk (see interpreter.rs); they never
/// surface as Rust errors unless they escape every protected frame. The
/// enums here cover everything that crosses the VM boundary: bytecode
/// loading, resource exhaustion, and uncaught guest errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("resource limit exceeded: {0}")]
    ResourceExhausted(&'static str),

    /// A guest error escaped every pcall/xpcall frame. The payload is the
    /// error object rendered with tostring semantics.
    #[error("Uncaught error: {0}")]
    Uncaught(String),

    #[error("bytecode load error: {0}")]
    Load(#[from] LoadError),

    #[error("stack overflow")]
    StackOverflow,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    #[error("opcode '{op}' expects {expected} operands, got {got}")]
    BadOperandCount {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("broken compare/branch fusion: {0}")]
    MissingJumpFusion(&'static str),

    #[error("operand out of range for '{op}': {value}")]
    OperandRange { op: &'static str, value: i64 },

    #[error("branch target {0} does not start an instruction")]
    BadJumpTarget(i64),

    #[error("prototype {0} referenced before definition")]
    BadPrototypeRef(usize),

    #[error("{0}")]
    Malformed(String),
}
