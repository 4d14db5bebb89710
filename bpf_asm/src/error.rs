//! Assembly error types

use thiserror::Error;

/// Errors produced while encoding or decoding bytecode
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AsmError {
    /// A single-slot instruction carries a constant that does not fit in 32 bits
    #[error("constant {constant} of instruction {index} does not fit in 32 bits")]
    ConstantOutOfRange { index: usize, constant: i64 },

    /// Raw bytecode length is not a multiple of the instruction size
    #[error("bytecode length {0} is not a multiple of the instruction size")]
    TruncatedBytecode(usize),
}
