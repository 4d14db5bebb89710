//! Opcodes, registers and builtin helper numbers

use core::fmt;
use serde::{Deserialize, Serialize};

/// An 8-bit instruction opcode
///
/// The low three bits select the instruction class; the remaining bits
/// encode the operation and operand source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpCode(u8);

impl OpCode {
    /// `r_dst = imm64` (occupies two instruction slots)
    pub const LOAD_IMM_DW: OpCode = OpCode(0x18);
    /// `w_dst = imm32`
    pub const MOV32_IMM: OpCode = OpCode(0xb4);
    /// `r_dst = imm32` (sign extended)
    pub const MOV_IMM: OpCode = OpCode(0xb7);
    /// `r_dst = r_src`
    pub const MOV_REG: OpCode = OpCode(0xbf);
    /// `r_dst += imm32`
    pub const ADD_IMM: OpCode = OpCode(0x07);
    /// `r_dst += r_src`
    pub const ADD_REG: OpCode = OpCode(0x0f);
    /// Helper call, or a subprogram call when `src` is [`Register::PSEUDO_CALL`]
    pub const CALL: OpCode = OpCode(0x85);
    /// Return `r0` to the caller
    pub const EXIT: OpCode = OpCode(0x95);

    const CLASS_MASK: u8 = 0x07;

    /// Creates an opcode from its raw encoding
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw encoding
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns the instruction class bits
    pub const fn class(self) -> u8 {
        self.0 & Self::CLASS_MASK
    }

    /// Whether this opcode occupies two raw instruction slots
    pub const fn is_double_width(self) -> bool {
        self.0 == Self::LOAD_IMM_DW.0
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({:#04x})", self.0)
    }
}

/// A register number (r0 to r10)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Register(u8);

impl Register {
    pub const R0: Register = Register(0);
    pub const R1: Register = Register(1);
    pub const R2: Register = Register(2);
    pub const R3: Register = Register(3);
    pub const R4: Register = Register(4);
    pub const R5: Register = Register(5);
    pub const R6: Register = Register(6);
    pub const R7: Register = Register(7);
    pub const R8: Register = Register(8);
    pub const R9: Register = Register(9);
    /// Read-only frame pointer
    pub const R10: Register = Register(10);

    /// Source register value marking a call as a subprogram call
    pub const PSEUDO_CALL: Register = Register(1);

    /// Number of addressable registers
    pub const COUNT: usize = 11;

    /// Creates a register from its raw 4-bit number
    pub const fn new(raw: u8) -> Self {
        Self(raw & 0x0f)
    }

    /// Returns the register number
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Kernel helper functions callable from programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum BuiltinFunc {
    MapLookupElem = 1,
    ProbeRead = 4,
    KtimeGetNs = 5,
    TracePrintk = 6,
    ProbeReadKernel = 113,
}

impl BuiltinFunc {
    /// Returns the helper number as encoded in the call's constant
    pub const fn number(self) -> i32 {
        self as i32
    }
}
