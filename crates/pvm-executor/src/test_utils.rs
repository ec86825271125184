//! Helpers for building program blobs in tests and tools.

use crate::{
    constants::vm::{A0, A1, HEAP_START, RA},
    interpreter::{encode_varint, opcode, sign_extend, Reg},
};

/// A forward-referencable code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles program blobs instruction by instruction.
///
/// Immediates use the shortest encoding; branch and jump offsets always take four bytes so that
/// labels can be bound after they are referenced.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<u8>,
    starts: Vec<usize>,
    labels: Vec<Option<u32>>,
    /// (position of the offset bytes, pc of the instruction, label)
    fixups: Vec<(usize, u32, Label)>,
    jump_table: Vec<Label>,
}

fn imm_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    (0..=8)
        .map(|len| bytes[..len].to_vec())
        .find(|candidate| sign_extend(candidate) == value as u64)
        .unwrap_or_else(|| bytes.to_vec())
}

impl ProgramBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.pc());
        self
    }

    /// Adds `label` to the jump table and returns the address `jump_ind` needs to reach it.
    pub fn jump_target(&mut self, label: Label) -> u32 {
        self.jump_table.push(label);
        self.jump_table.len() as u32 * 2
    }

    /// Offset of the next instruction.
    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit(&mut self, opcode: u8, operands: &[u8]) -> &mut Self {
        self.starts.push(self.code.len());
        self.code.push(opcode);
        self.code.extend_from_slice(operands);
        self
    }

    fn emit_with_offset(&mut self, opcode: u8, operands: &[u8], target: Label) -> &mut Self {
        let pc = self.pc();
        self.emit(opcode, operands);
        self.fixups.push((self.code.len(), pc, target));
        self.code.extend_from_slice(&[0; 4]);
        self
    }

    fn regs(low: Reg, high: Reg) -> u8 {
        (low as u8 & 0x0F) | ((high as u8) << 4)
    }

    fn reg_imm(&mut self, opcode: u8, reg: Reg, value: i64) -> &mut Self {
        let mut operands = vec![reg as u8];
        operands.extend(imm_bytes(value));
        self.emit(opcode, &operands)
    }

    /// `trap`
    pub fn trap(&mut self) -> &mut Self {
        self.emit(opcode::TRAP, &[])
    }

    /// `fallthrough`
    pub fn fallthrough(&mut self) -> &mut Self {
        self.emit(opcode::FALLTHROUGH, &[])
    }

    /// `ecalli index`
    pub fn ecalli(&mut self, index: u32) -> &mut Self {
        self.emit(opcode::ECALLI, &imm_bytes(i64::from(index as i32)))
    }

    /// `reg = value`, sign extended from 32 bits.
    pub fn load_imm(&mut self, reg: Reg, value: i32) -> &mut Self {
        self.reg_imm(opcode::LOAD_IMM, reg, value.into())
    }

    /// `reg = value`
    pub fn load_imm_64(&mut self, reg: Reg, value: u64) -> &mut Self {
        let mut operands = vec![reg as u8];
        operands.extend_from_slice(&value.to_le_bytes());
        self.emit(opcode::LOAD_IMM_64, &operands)
    }

    /// Unconditional jump to `target`.
    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.emit_with_offset(opcode::JUMP, &[], target)
    }

    /// Dynamic jump to `reg + offset`.
    pub fn jump_ind(&mut self, reg: Reg, offset: i32) -> &mut Self {
        self.reg_imm(opcode::JUMP_IND, reg, offset.into())
    }

    /// Returns to the initial return address, which halts the program.
    pub fn halt(&mut self) -> &mut Self {
        self.jump_ind(RA, 0)
    }

    /// `reg = memory[address]`, one byte.
    pub fn load_u8(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::LOAD_U8, reg, i64::from(address as i32))
    }

    /// `reg = memory[address]`, four bytes.
    pub fn load_u32(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::LOAD_U32, reg, i64::from(address as i32))
    }

    /// `reg = memory[address]`, eight bytes.
    pub fn load_u64(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::LOAD_U64, reg, i64::from(address as i32))
    }

    /// `memory[address] = reg`, one byte.
    pub fn store_u8(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::STORE_U8, reg, i64::from(address as i32))
    }

    /// `memory[address] = reg`, four bytes.
    pub fn store_u32(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::STORE_U32, reg, i64::from(address as i32))
    }

    /// `memory[address] = reg`, eight bytes.
    pub fn store_u64(&mut self, reg: Reg, address: u32) -> &mut Self {
        self.reg_imm(opcode::STORE_U64, reg, i64::from(address as i32))
    }

    fn branch_imm(&mut self, opcode: u8, reg: Reg, value: i32, target: Label) -> &mut Self {
        let imm = imm_bytes(value.into());
        let mut operands = vec![(reg as u8 & 0x0F) | ((imm.len() as u8) << 4)];
        operands.extend(imm);
        self.emit_with_offset(opcode, &operands, target)
    }

    /// Branch to `target` when `reg == value`.
    pub fn branch_eq_imm(&mut self, reg: Reg, value: i32, target: Label) -> &mut Self {
        self.branch_imm(opcode::BRANCH_EQ_IMM, reg, value, target)
    }

    /// Branch to `target` when `reg != value`.
    pub fn branch_ne_imm(&mut self, reg: Reg, value: i32, target: Label) -> &mut Self {
        self.branch_imm(opcode::BRANCH_NE_IMM, reg, value, target)
    }

    /// `dst = src`
    pub fn move_reg(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(opcode::MOVE_REG, &[Self::regs(dst, src)])
    }

    /// `dst = src + value`
    pub fn add_imm_64(&mut self, dst: Reg, src: Reg, value: i32) -> &mut Self {
        let mut operands = vec![Self::regs(dst, src)];
        operands.extend(imm_bytes(value.into()));
        self.emit(opcode::ADD_IMM_64, &operands)
    }

    /// Branch to `target` when `lhs == rhs`.
    pub fn branch_eq(&mut self, lhs: Reg, rhs: Reg, target: Label) -> &mut Self {
        self.emit_with_offset(opcode::BRANCH_EQ, &[Self::regs(lhs, rhs)], target)
    }

    /// Branch to `target` when `lhs != rhs`.
    pub fn branch_ne(&mut self, lhs: Reg, rhs: Reg, target: Label) -> &mut Self {
        self.emit_with_offset(opcode::BRANCH_NE, &[Self::regs(lhs, rhs)], target)
    }

    /// Branch to `target` when `lhs < rhs`, unsigned.
    pub fn branch_lt_u(&mut self, lhs: Reg, rhs: Reg, target: Label) -> &mut Self {
        self.emit_with_offset(opcode::BRANCH_LT_U, &[Self::regs(lhs, rhs)], target)
    }

    /// `dst = lhs + rhs`
    pub fn add_64(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(opcode::ADD_64, &[Self::regs(lhs, rhs), dst as u8])
    }

    /// `dst = lhs - rhs`
    pub fn sub_64(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(opcode::SUB_64, &[Self::regs(lhs, rhs), dst as u8])
    }

    /// `dst = lhs * rhs`
    pub fn mul_64(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(opcode::MUL_64, &[Self::regs(lhs, rhs), dst as u8])
    }

    fn resolve(&self, label: Label) -> u32 {
        self.labels[label.0].unwrap_or_else(|| panic!("label {} was never bound", label.0))
    }

    /// Encodes the program blob.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never bound.
    pub fn build(&self) -> Vec<u8> {
        let mut code = self.code.clone();
        for (position, pc, label) in &self.fixups {
            let offset = self.resolve(*label).wrapping_sub(*pc);
            code[*position..*position + 4].copy_from_slice(&offset.to_le_bytes());
        }

        let mut bitmask = vec![0u8; code.len().div_ceil(8)];
        for start in &self.starts {
            bitmask[start / 8] |= 1 << (start % 8);
        }

        let mut blob = Vec::new();
        encode_varint(self.jump_table.len() as u64, &mut blob);
        blob.push(if self.jump_table.is_empty() { 0 } else { 4 });
        encode_varint(code.len() as u64, &mut blob);
        for label in &self.jump_table {
            blob.extend_from_slice(&self.resolve(*label).to_le_bytes());
        }
        blob.extend_from_slice(&code);
        blob.extend_from_slice(&bitmask);
        blob
    }
}

/// `load 100, load 42, add, halt`, leaving 142 in the result register `r7`.
pub fn add_program() -> Vec<u8> {
    ProgramBuilder::new().load_imm(9, 100).load_imm(10, 42).add_64(A0, 9, 10).halt().build()
}

/// Halts immediately, so the output is the argument data.
pub fn echo_program() -> Vec<u8> {
    ProgramBuilder::new().halt().build()
}

/// Sums `1..=n` into `r7`, where `n` is loaded into `r9` first.
pub fn sum_to_n_program(n: i32) -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let (head, done) = (builder.label(), builder.label());
    builder.load_imm(9, n).load_imm(A0, 0).load_imm(A1, 0);
    builder.bind(head).branch_eq_imm(9, 0, done).add_64(A0, A0, 9).add_imm_64(9, 9, -1).jump(head);
    builder.bind(done).halt();
    builder.build()
}

/// Spins forever; only the gas budget stops it.
pub fn infinite_loop_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let head = builder.label();
    builder.bind(head).fallthrough().jump(head);
    builder.build()
}

/// Invokes host call `index`, then stores `r7` to the heap and outputs those eight bytes.
pub fn host_call_program(index: u32) -> Vec<u8> {
    ProgramBuilder::new()
        .ecalli(index)
        .store_u64(A0, HEAP_START)
        .load_imm(A0, HEAP_START as i32)
        .load_imm(A1, 8)
        .halt()
        .build()
}
