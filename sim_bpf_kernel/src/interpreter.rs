//! Tiny interpreter for loaded programs
//!
//! Executes the subset of instructions the loader emits, which is enough to
//! check that linked subprogram calls land where they should.

use bpf_asm::{BuiltinFunc, OpCode, RawInstruction, Register};
use bpf_sys::Errno;

/// Deepest call chain a program may build, matching the kernel's limit
pub const MAX_CALL_FRAMES: usize = 8;

const STEP_LIMIT: usize = 1 << 20;

struct Frame {
    return_pc: usize,
    saved: [u64; 4],
}

/// Runs `insns` from the first slot and returns `r0`
pub fn run(insns: &[RawInstruction]) -> Result<u64, Errno> {
    let mut regs = [0u64; Register::COUNT];
    let mut frames: Vec<Frame> = Vec::new();
    let mut pc = 0usize;

    for _ in 0..STEP_LIMIT {
        let ins = insns.get(pc).ok_or(Errno::EFAULT)?;
        let dst = usize::from(ins.dst.raw());
        let src = usize::from(ins.src.raw());
        let imm = i64::from(ins.constant) as u64;

        match ins.op {
            OpCode::MOV_REG => regs[dst] = regs[src],
            OpCode::MOV_IMM => regs[dst] = imm,
            OpCode::MOV32_IMM => regs[dst] = u64::from(ins.constant as u32),
            OpCode::ADD_IMM => regs[dst] = regs[dst].wrapping_add(imm),
            OpCode::ADD_REG => regs[dst] = regs[dst].wrapping_add(regs[src]),
            OpCode::LOAD_IMM_DW => {
                let high = insns.get(pc + 1).ok_or(Errno::EFAULT)?;
                regs[dst] =
                    u64::from(ins.constant as u32) | (u64::from(high.constant as u32) << 32);
                pc += 1;
            }
            OpCode::CALL if ins.src == Register::PSEUDO_CALL => {
                if frames.len() == MAX_CALL_FRAMES {
                    return Err(Errno::E2BIG);
                }
                frames.push(Frame {
                    return_pc: pc + 1,
                    saved: [regs[6], regs[7], regs[8], regs[9]],
                });
                pc = jump_target(pc, ins.constant, insns.len())?;
                continue;
            }
            OpCode::CALL => {
                regs[0] = match ins.constant {
                    n if n == BuiltinFunc::KtimeGetNs.number() => 0,
                    n if n == BuiltinFunc::ProbeRead.number() => 0,
                    n if n == BuiltinFunc::ProbeReadKernel.number() => 0,
                    _ => return Err(Errno::EINVAL),
                };
            }
            OpCode::EXIT => match frames.pop() {
                Some(frame) => {
                    regs[6..10].copy_from_slice(&frame.saved);
                    pc = frame.return_pc;
                    continue;
                }
                None => return Ok(regs[0]),
            },
            _ => return Err(Errno::EINVAL),
        }
        pc += 1;
    }

    Err(Errno::E2BIG)
}

/// Resolves a pc-relative call, `pc + 1 + offset`
pub fn jump_target(pc: usize, offset: i32, len: usize) -> Result<usize, Errno> {
    let target = pc as i64 + 1 + i64::from(offset);
    if target < 0 || target >= len as i64 {
        return Err(Errno::EINVAL);
    }
    Ok(target as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf_asm::{marshal, unmarshal_raw, Endian, Instruction};

    fn raw(insns: &[Instruction]) -> Vec<RawInstruction> {
        unmarshal_raw(&marshal(insns, Endian::Little).unwrap(), Endian::Little).unwrap()
    }

    #[test]
    fn test_run_returns_r0() {
        let insns = raw(&[
            Instruction::mov_imm(Register::R0, 7),
            Instruction::add_imm(Register::R0, 3),
            Instruction::exit(),
        ]);
        assert_eq!(run(&insns), Ok(10));
    }

    #[test]
    fn test_run_wide_load() {
        let insns = raw(&[Instruction::load_imm64(Register::R0, 1337), Instruction::exit()]);
        assert_eq!(run(&insns), Ok(1337));
    }

    #[test]
    fn test_run_subprogram_call() {
        let mut call = Instruction::call_label("sub");
        call.constant = 1;
        let insns = raw(&[
            call,
            Instruction::exit(),
            Instruction::mov_imm(Register::R0, 5),
            Instruction::exit(),
        ]);
        assert_eq!(run(&insns), Ok(5));
    }

    #[test]
    fn test_run_rejects_runaway_recursion() {
        let mut call = Instruction::call_label("self");
        call.constant = -1;
        let insns = raw(&[call, Instruction::exit()]);
        assert_eq!(run(&insns), Err(Errno::E2BIG));
    }

    #[test]
    fn test_jump_target_bounds() {
        assert_eq!(jump_target(0, 1, 3), Ok(2));
        assert_eq!(jump_target(2, -3, 3), Ok(0));
        assert_eq!(jump_target(0, 2, 3), Err(Errno::EINVAL));
        assert_eq!(jump_target(0, -2, 3), Err(Errno::EINVAL));
    }
}
