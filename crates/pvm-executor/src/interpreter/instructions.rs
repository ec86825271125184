//! Instruction decoding.
//!
//! Only a subset of the PVM instruction set is supported. Any other opcode decodes to
//! [`Instruction::Invalid`] and traps.

use crate::{constants::vm::REGISTER_COUNT, interpreter::program::ProgramCode};

/// Opcode numbers of the supported instructions.
pub mod opcode {
    #![allow(missing_docs)]

    pub const TRAP: u8 = 0;
    pub const FALLTHROUGH: u8 = 1;
    pub const ECALLI: u8 = 10;
    pub const LOAD_IMM_64: u8 = 20;
    pub const JUMP: u8 = 40;
    pub const JUMP_IND: u8 = 50;
    pub const LOAD_IMM: u8 = 51;
    pub const LOAD_U8: u8 = 52;
    pub const LOAD_U32: u8 = 56;
    pub const LOAD_U64: u8 = 58;
    pub const STORE_U8: u8 = 59;
    pub const STORE_U32: u8 = 61;
    pub const STORE_U64: u8 = 62;
    pub const BRANCH_EQ_IMM: u8 = 81;
    pub const BRANCH_NE_IMM: u8 = 82;
    pub const MOVE_REG: u8 = 100;
    pub const ADD_IMM_64: u8 = 149;
    pub const BRANCH_EQ: u8 = 170;
    pub const BRANCH_NE: u8 = 171;
    pub const BRANCH_LT_U: u8 = 172;
    pub const ADD_64: u8 = 200;
    pub const SUB_64: u8 = 201;
    pub const MUL_64: u8 = 202;
}

/// A register index, always below [`REGISTER_COUNT`].
pub type Reg = usize;

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One byte.
    U8,
    /// Four bytes.
    U32,
    /// Eight bytes.
    U64,
}

/// Comparison performed by a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less than.
    LtU,
}

impl Condition {
    /// Evaluates the condition.
    pub const fn holds(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::LtU => lhs < rhs,
        }
    }
}

/// A three register arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
}

impl ArithOp {
    /// Applies the operation.
    pub const fn apply(self, lhs: u64, rhs: u64) -> u64 {
        match self {
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
        }
    }
}

/// A decoded instruction. Branch and jump targets are absolute code offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Unconditional panic.
    Trap,
    /// Marks the end of a basic block.
    Fallthrough,
    /// Host call.
    Ecalli(u32),
    /// `reg = imm` with a full 64-bit immediate.
    LoadImm64(Reg, u64),
    /// Relative jump.
    Jump(u32),
    /// Dynamic jump through the jump table to `reg + offset`.
    JumpInd(Reg, u32),
    /// `reg = imm`, sign extended.
    LoadImm(Reg, u64),
    /// `reg = memory[address]`.
    Load(Width, Reg, u32),
    /// `memory[address] = reg`.
    Store(Width, Reg, u32),
    /// Branch to `target` when `reg <cond> imm`.
    BranchImm(Condition, Reg, u64, u32),
    /// `dst = src`, laid out as `(dst, src)`.
    MoveReg(Reg, Reg),
    /// `dst = src + imm`, laid out as `(dst, src, imm)`.
    AddImm64(Reg, Reg, u64),
    /// Branch to `target` when `lhs <cond> rhs`.
    Branch(Condition, Reg, Reg, u32),
    /// `dst = lhs <op> rhs`, laid out as `(op, lhs, rhs, dst)`.
    Arith(ArithOp, Reg, Reg, Reg),
    /// Any opcode outside the supported set.
    Invalid,
}

/// Sign extends the little-endian `bytes` (at most 8) to 64 bits.
pub fn sign_extend(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let value = bytes.iter().rev().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    let shift = 64 - 8 * bytes.len() as u32;
    (((value << shift) as i64) >> shift) as u64
}

/// Operand reader for the instruction at one program counter.
#[derive(Debug)]
struct Operands<'a> {
    program: &'a ProgramCode,
    pc: u32,
    skip: u32,
}

impl Operands<'_> {
    /// Operand byte `n`, counted from the opcode.
    fn byte(&self, n: u32) -> u8 {
        self.program.byte(self.pc + n)
    }

    /// Sign-extended immediate of `len` bytes starting at operand byte `at`.
    fn imm(&self, at: u32, len: u32) -> u64 {
        let bytes: Vec<u8> = (0..len).map(|i| self.byte(at + i)).collect();
        sign_extend(&bytes)
    }

    fn target(&self, offset: u64) -> u32 {
        self.pc.wrapping_add(offset as u32)
    }

    fn low_reg(&self) -> Reg {
        reg(self.byte(1) & 0x0F)
    }

    fn high_reg(&self) -> Reg {
        reg(self.byte(1) >> 4)
    }

    /// Length of the immediate following a single register byte.
    fn imm_len_after_reg(&self) -> u32 {
        self.skip.saturating_sub(1).min(4)
    }
}

fn reg(raw: u8) -> Reg {
    (raw as usize).min(REGISTER_COUNT - 1)
}

/// Decodes the instruction at `pc`. `skip` is the operand length derived from the bitmask.
pub fn decode(program: &ProgramCode, pc: u32, skip: u32) -> Instruction {
    let ops = Operands { program, pc, skip };
    match program.opcode(pc) {
        opcode::TRAP => Instruction::Trap,
        opcode::FALLTHROUGH => Instruction::Fallthrough,
        opcode::ECALLI => Instruction::Ecalli(ops.imm(1, skip.min(4)) as u32),
        opcode::LOAD_IMM_64 => {
            let value = (0..8).rev().fold(0u64, |acc, i| (acc << 8) | u64::from(ops.byte(2 + i)));
            Instruction::LoadImm64(ops.low_reg(), value)
        }
        opcode::JUMP => Instruction::Jump(ops.target(ops.imm(1, skip.min(4)))),
        op @ (opcode::JUMP_IND |
        opcode::LOAD_IMM |
        opcode::LOAD_U8 |
        opcode::LOAD_U32 |
        opcode::LOAD_U64 |
        opcode::STORE_U8 |
        opcode::STORE_U32 |
        opcode::STORE_U64) => {
            let ra = ops.low_reg();
            let imm = ops.imm(2, ops.imm_len_after_reg());
            match op {
                opcode::JUMP_IND => Instruction::JumpInd(ra, imm as u32),
                opcode::LOAD_IMM => Instruction::LoadImm(ra, imm),
                opcode::LOAD_U8 => Instruction::Load(Width::U8, ra, imm as u32),
                opcode::LOAD_U32 => Instruction::Load(Width::U32, ra, imm as u32),
                opcode::LOAD_U64 => Instruction::Load(Width::U64, ra, imm as u32),
                opcode::STORE_U8 => Instruction::Store(Width::U8, ra, imm as u32),
                opcode::STORE_U32 => Instruction::Store(Width::U32, ra, imm as u32),
                _ => Instruction::Store(Width::U64, ra, imm as u32),
            }
        }
        op @ (opcode::BRANCH_EQ_IMM | opcode::BRANCH_NE_IMM) => {
            let ra = ops.low_reg();
            let imm_len = u32::from((ops.byte(1) >> 4) & 0x07).min(4);
            let offset_len = skip.saturating_sub(imm_len + 1).min(4);
            let imm = ops.imm(2, imm_len);
            let target = ops.target(ops.imm(2 + imm_len, offset_len));
            let cond = if op == opcode::BRANCH_EQ_IMM { Condition::Eq } else { Condition::Ne };
            Instruction::BranchImm(cond, ra, imm, target)
        }
        opcode::MOVE_REG => Instruction::MoveReg(ops.low_reg(), ops.high_reg()),
        opcode::ADD_IMM_64 => {
            Instruction::AddImm64(ops.low_reg(), ops.high_reg(), ops.imm(2, ops.imm_len_after_reg()))
        }
        op @ (opcode::BRANCH_EQ | opcode::BRANCH_NE | opcode::BRANCH_LT_U) => {
            let target = ops.target(ops.imm(2, ops.imm_len_after_reg()));
            let cond = match op {
                opcode::BRANCH_EQ => Condition::Eq,
                opcode::BRANCH_NE => Condition::Ne,
                _ => Condition::LtU,
            };
            Instruction::Branch(cond, ops.low_reg(), ops.high_reg(), target)
        }
        op @ (opcode::ADD_64 | opcode::SUB_64 | opcode::MUL_64) => {
            let arith = match op {
                opcode::ADD_64 => ArithOp::Add,
                opcode::SUB_64 => ArithOp::Sub,
                _ => ArithOp::Mul,
            };
            Instruction::Arith(arith, ops.low_reg(), ops.high_reg(), reg(ops.byte(2)))
        }
        _ => Instruction::Invalid,
    }
}
