//! Instructions and their byte encoding

use crate::{AsmError, BuiltinFunc, OpCode, Register};
use serde::{Deserialize, Serialize};

/// Size of one raw instruction slot in bytes
pub const INSTRUCTION_SIZE: usize = 8;

/// Byte order used when encoding bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the host, which is what the kernel expects
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };
}

/// A single instruction plus its optional symbol and reference tags
///
/// The symbol marks this instruction as the start of a named block. The
/// reference marks it as a call whose target is resolved by name at link
/// time. Each tag is present at most once per instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    pub dst: Register,
    pub src: Register,
    pub offset: i16,
    pub constant: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
}

impl Instruction {
    /// Creates an untagged instruction from its fields
    pub fn new(op: OpCode, dst: Register, src: Register, offset: i16, constant: i64) -> Self {
        Self {
            op,
            dst,
            src,
            offset,
            constant,
            symbol: None,
            reference: None,
        }
    }

    /// `dst = src`
    pub fn mov_reg(dst: Register, src: Register) -> Self {
        Self::new(OpCode::MOV_REG, dst, src, 0, 0)
    }

    /// `dst = imm` (64-bit, sign extended)
    pub fn mov_imm(dst: Register, imm: i32) -> Self {
        Self::new(OpCode::MOV_IMM, dst, Register::R0, 0, imm.into())
    }

    /// `dst = imm` (32-bit, upper half zeroed)
    pub fn mov_imm32(dst: Register, imm: i32) -> Self {
        Self::new(OpCode::MOV32_IMM, dst, Register::R0, 0, imm.into())
    }

    /// `dst += imm`
    pub fn add_imm(dst: Register, imm: i32) -> Self {
        Self::new(OpCode::ADD_IMM, dst, Register::R0, 0, imm.into())
    }

    /// `dst = value`, a double-width load of a full 64-bit constant
    pub fn load_imm64(dst: Register, value: i64) -> Self {
        Self::new(OpCode::LOAD_IMM_DW, dst, Register::R0, 0, value)
    }

    /// Calls the block whose symbol is `name`
    ///
    /// The constant stays `-1` until the linker relocates the call.
    pub fn call_label(name: impl Into<String>) -> Self {
        Self::new(OpCode::CALL, Register::R0, Register::PSEUDO_CALL, 0, -1).with_reference(name)
    }

    /// Calls a kernel helper
    pub fn call_builtin(func: BuiltinFunc) -> Self {
        Self::new(OpCode::CALL, Register::R0, Register::R0, 0, func.number().into())
    }

    /// Returns from the current function
    pub fn exit() -> Self {
        Self::new(OpCode::EXIT, Register::R0, Register::R0, 0, 0)
    }

    /// Tags this instruction as the start of the block `name`
    pub fn with_symbol(mut self, name: impl Into<String>) -> Self {
        self.symbol = Some(name.into());
        self
    }

    /// Tags this instruction as referring to the block `name`
    pub fn with_reference(mut self, name: impl Into<String>) -> Self {
        self.reference = Some(name.into());
        self
    }

    /// Replaces the symbol tag in place
    pub fn set_symbol(&mut self, name: impl Into<String>) {
        self.symbol = Some(name.into());
    }

    /// Returns the symbol tag, if any
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    /// Returns the reference tag, if any
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Number of raw slots this instruction occupies
    pub fn width(&self) -> usize {
        if self.op.is_double_width() {
            2
        } else {
            1
        }
    }

    /// Whether this is a call to another block rather than a helper
    pub fn is_function_call(&self) -> bool {
        self.op == OpCode::CALL && self.src == Register::PSEUDO_CALL
    }

    /// Appends the raw encoding of this instruction to `out`
    fn encode(&self, index: usize, out: &mut Vec<u8>, endian: Endian) -> Result<(), AsmError> {
        if self.op.is_double_width() {
            let low = self.constant as u32 as i32;
            let high = (self.constant >> 32) as i32;
            encode_slot(out, endian, self.op.raw(), self.dst, self.src, self.offset, low);
            encode_slot(out, endian, 0, Register::R0, Register::R0, 0, high);
            return Ok(());
        }

        let constant = i32::try_from(self.constant).map_err(|_| AsmError::ConstantOutOfRange {
            index,
            constant: self.constant,
        })?;
        encode_slot(out, endian, self.op.raw(), self.dst, self.src, self.offset, constant);
        Ok(())
    }
}

fn encode_slot(
    out: &mut Vec<u8>,
    endian: Endian,
    op: u8,
    dst: Register,
    src: Register,
    offset: i16,
    constant: i32,
) {
    out.push(op);
    match endian {
        Endian::Little => {
            out.push((src.raw() << 4) | dst.raw());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&constant.to_le_bytes());
        }
        Endian::Big => {
            out.push((dst.raw() << 4) | src.raw());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&constant.to_be_bytes());
        }
    }
}

/// Total encoded size of `insns` in bytes
pub fn size(insns: &[Instruction]) -> usize {
    insns.iter().map(|ins| ins.width() * INSTRUCTION_SIZE).sum()
}

/// Encodes `insns` into exact-width bytecode
///
/// Tags are not encoded. Calls are emitted with whatever constant they
/// carry, so references must be relocated beforehand.
pub fn marshal(insns: &[Instruction], endian: Endian) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::with_capacity(size(insns));
    for (index, ins) in insns.iter().enumerate() {
        ins.encode(index, &mut out, endian)?;
    }
    Ok(out)
}

/// Returns the distinct names referenced by function calls, in first-use order
pub fn function_references(insns: &[Instruction]) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for ins in insns.iter().filter(|ins| ins.is_function_call()) {
        if let Some(name) = ins.reference() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// One decoded raw instruction slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    pub op: OpCode,
    pub dst: Register,
    pub src: Register,
    pub offset: i16,
    pub constant: i32,
}

/// Decodes bytecode into raw slots
///
/// Double-width loads decode into two slots, exactly as the kernel sees them.
pub fn unmarshal_raw(bytecode: &[u8], endian: Endian) -> Result<Vec<RawInstruction>, AsmError> {
    if bytecode.len() % INSTRUCTION_SIZE != 0 {
        return Err(AsmError::TruncatedBytecode(bytecode.len()));
    }

    let slots = bytecode
        .chunks_exact(INSTRUCTION_SIZE)
        .map(|slot| {
            let (dst, src) = match endian {
                Endian::Little => (slot[1] & 0x0f, slot[1] >> 4),
                Endian::Big => (slot[1] >> 4, slot[1] & 0x0f),
            };
            let offset = [slot[2], slot[3]];
            let constant = [slot[4], slot[5], slot[6], slot[7]];
            let (offset, constant) = match endian {
                Endian::Little => (i16::from_le_bytes(offset), i32::from_le_bytes(constant)),
                Endian::Big => (i16::from_be_bytes(offset), i32::from_be_bytes(constant)),
            };
            RawInstruction {
                op: OpCode::new(slot[0]),
                dst: Register::new(dst),
                src: Register::new(src),
                offset,
                constant,
            }
        })
        .collect();
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_label_carries_reference() {
        let call = Instruction::call_label("my_func");
        assert!(call.is_function_call());
        assert_eq!(call.reference(), Some("my_func"));
        assert_eq!(call.symbol(), None);
        assert_eq!(call.constant, -1);
    }

    #[test]
    fn test_builtin_call_is_not_function_call() {
        let call = Instruction::call_builtin(BuiltinFunc::ProbeReadKernel);
        assert!(!call.is_function_call());
        assert_eq!(call.constant, 113);
    }

    #[test]
    fn test_double_width_load() {
        let insns = vec![Instruction::load_imm64(Register::R0, 0x1_0000_0002), Instruction::exit()];
        assert_eq!(size(&insns), 24);

        let bytecode = marshal(&insns, Endian::Little).unwrap();
        let raw = unmarshal_raw(&bytecode, Endian::Little).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0].op, OpCode::LOAD_IMM_DW);
        assert_eq!(raw[0].constant, 2);
        assert_eq!(raw[1].constant, 1);
        assert_eq!(raw[2].op, OpCode::EXIT);
    }

    #[test]
    fn test_register_nibbles_follow_endianness() {
        let insns = vec![Instruction::mov_reg(Register::R1, Register::R10)];

        let little = marshal(&insns, Endian::Little).unwrap();
        assert_eq!(little[1], 0xa1);

        let big = marshal(&insns, Endian::Big).unwrap();
        assert_eq!(big[1], 0x1a);

        let decoded = unmarshal_raw(&big, Endian::Big).unwrap();
        assert_eq!(decoded[0].dst, Register::R1);
        assert_eq!(decoded[0].src, Register::R10);
    }

    #[test]
    fn test_constant_out_of_range() {
        let mut ins = Instruction::mov_imm(Register::R0, 0);
        ins.constant = i64::from(i32::MAX) + 1;

        let err = marshal(&[Instruction::exit(), ins], Endian::Little).unwrap_err();
        assert_eq!(
            err,
            AsmError::ConstantOutOfRange {
                index: 1,
                constant: i64::from(i32::MAX) + 1
            }
        );
    }

    #[test]
    fn test_truncated_bytecode() {
        assert_eq!(
            unmarshal_raw(&[0u8; 12], Endian::Little),
            Err(AsmError::TruncatedBytecode(12))
        );
    }

    #[test]
    fn test_function_references_are_unique_and_ordered() {
        let insns = vec![
            Instruction::call_label("b"),
            Instruction::call_label("a"),
            Instruction::call_label("b"),
            Instruction::mov_imm(Register::R0, 0).with_reference("not_a_call"),
            Instruction::exit(),
        ];
        assert_eq!(function_references(&insns), vec!["b", "a"]);
    }

    #[test]
    fn test_tags_survive_json() {
        let ins = Instruction::exit().with_symbol("sym");
        let json = serde_json::to_string(&ins).unwrap();
        assert!(!json.contains("reference"));

        let decoded: Instruction = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ins);
        assert_eq!(decoded.symbol(), Some("sym"));
    }
}
