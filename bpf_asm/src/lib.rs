//! # Bytecode Assembly
//!
//! This crate defines the instruction model shared by the linker, the
//! request gateway and the simulated kernel.
//!
//! ## Philosophy
//!
//! - **Tags, not offsets**: Callers describe calls by name. An instruction may
//!   carry a *symbol* (it starts a named block) and a *reference* (it calls a
//!   named block). Offsets are computed later, by the linker.
//! - **Minimal surface**: Only the opcodes the loader core needs to build,
//!   link and probe programs are modelled. This is not a general assembler.
//! - **Endian-aware**: Encoding and decoding take an explicit [`Endian`].
//!
//! ## Example
//!
//! ```
//! use bpf_asm::{marshal, Endian, Instruction, Register};
//!
//! let insns = vec![
//!     Instruction::mov_imm(Register::R0, 0).with_symbol("entry"),
//!     Instruction::exit(),
//! ];
//! let bytecode = marshal(&insns, Endian::Little).unwrap();
//! assert_eq!(bytecode.len(), 16);
//! ```

pub mod error;
pub mod instruction;
pub mod opcode;

pub use error::AsmError;
pub use instruction::{
    function_references, marshal, size, unmarshal_raw, Endian, Instruction, RawInstruction,
    INSTRUCTION_SIZE,
};
pub use opcode::{BuiltinFunc, OpCode, Register};
