//! A small PVM interpreter.
//!
//! It decodes the standard program blob, lays out the standard memory map and executes a subset
//! of the instruction set with per-instruction gas metering. Host calls are routed to an
//! [`InvocationContext`] when one is supplied.

mod instructions;
pub use instructions::*;

mod memory;
pub use memory::*;

mod program;
pub use program::*;

use crate::{
    constants::vm::{
        A0, A1, HALT_ADDRESS, HEAP_PAGES, HEAP_START, INPUT_SIZE, INPUT_START, INSTRUCTION_GAS,
        JUMP_ALIGNMENT, PAGE_SIZE, RA, REGISTER_COUNT, SP, STACK_PAGES, STACK_TOP,
    },
    gas::OutOfGas,
    ExitReason, Gas, GasMeter, HostCallOutcome, InvocationContext, MemoryFault, Registers,
    VmExecutionResult, VmState,
};

/// What the run loop does after one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Continue at the given program counter.
    Next(u32),
    /// Stop with the given reason.
    Exit(ExitReason),
    /// Dispatch the host call with the given index.
    HostCall(u32),
}

/// The state of one program run.
#[derive(Debug)]
pub struct Vm {
    program: ProgramCode,
    registers: Registers,
    memory: Memory,
    gas: GasMeter,
    pc: u32,
}

impl Vm {
    /// Loads `blob` and prepares the standard initial state.
    ///
    /// # Arguments
    ///
    /// * `blob` - The encoded program.
    /// * `pc` - The code offset to start at.
    /// * `gas` - The gas budget.
    /// * `argument_data` - Bytes mapped read-only into the argument region.
    pub fn new(
        blob: &[u8],
        pc: u32,
        gas: Gas,
        argument_data: Option<&[u8]>,
    ) -> Result<Self, ProgramError> {
        let program = ProgramCode::parse(blob)?;
        let argument_data = argument_data.unwrap_or_default();
        if argument_data.len() > INPUT_SIZE as usize {
            return Err(ProgramError::ArgumentTooLarge { size: argument_data.len() });
        }
        let argument_len = argument_data.len() as u32;

        let mut memory = Memory::new();
        memory.map(HEAP_START, HEAP_PAGES, PageAccess::ReadWrite, &[]);
        memory.map(STACK_TOP - STACK_PAGES * PAGE_SIZE, STACK_PAGES, PageAccess::ReadWrite, &[]);
        memory.map(
            INPUT_START,
            argument_len.div_ceil(PAGE_SIZE),
            PageAccess::ReadOnly,
            argument_data,
        );

        let mut registers = [0; REGISTER_COUNT];
        registers[RA] = u64::from(HALT_ADDRESS);
        registers[SP] = u64::from(STACK_TOP);
        registers[A0] = u64::from(INPUT_START);
        registers[A1] = u64::from(argument_len);

        Ok(Self { program, registers, memory, gas: GasMeter::new(gas), pc })
    }

    /// Runs until the program stops or hits a host call it cannot hand to `ctx`.
    pub fn run(&mut self, mut ctx: Option<&mut dyn InvocationContext>) -> ExitReason {
        let reason = loop {
            if self.gas.charge(INSTRUCTION_GAS).is_err() {
                break ExitReason::OutOfGas;
            }
            if !self.program.is_instruction_start(self.pc) {
                break ExitReason::TRAP;
            }
            let next = self.pc + 1 + self.program.skip(self.pc);
            let instruction = decode(&self.program, self.pc, next - self.pc - 1);
            match self.step(instruction, next) {
                Step::Next(pc) => self.pc = pc,
                Step::Exit(reason) => break reason,
                Step::HostCall(index) => {
                    let outcome = match ctx.as_mut() {
                        Some(ctx) => ctx.dispatch(index, self),
                        None => HostCallOutcome::Exit(ExitReason::HostCall(index)),
                    };
                    self.pc = next;
                    if let HostCallOutcome::Exit(reason) = outcome {
                        break reason;
                    }
                }
            }
        };
        if reason == ExitReason::OutOfGas {
            self.gas.drain();
        }
        reason
    }

    fn jump(&self, target: u32) -> Step {
        if self.program.is_instruction_start(target) {
            Step::Next(target)
        } else {
            Step::Exit(ExitReason::TRAP)
        }
    }

    fn dynamic_jump(&self, address: u32) -> Step {
        if address == HALT_ADDRESS {
            return Step::Exit(ExitReason::Halt);
        }
        if address == 0 || address % JUMP_ALIGNMENT != 0 {
            return Step::Exit(ExitReason::TRAP);
        }
        let index = (address / JUMP_ALIGNMENT - 1) as usize;
        match self.program.jump_table().get(index) {
            Some(target) => self.jump(*target),
            None => Step::Exit(ExitReason::TRAP),
        }
    }

    fn step(&mut self, instruction: Instruction, next: u32) -> Step {
        let regs = &mut self.registers;
        match instruction {
            Instruction::Trap | Instruction::Invalid => Step::Exit(ExitReason::TRAP),
            Instruction::Fallthrough => Step::Next(next),
            Instruction::Ecalli(index) => Step::HostCall(index),
            Instruction::LoadImm64(ra, value) | Instruction::LoadImm(ra, value) => {
                regs[ra] = value;
                Step::Next(next)
            }
            Instruction::Jump(target) => self.jump(target),
            Instruction::JumpInd(ra, offset) => {
                let address = (regs[ra] as u32).wrapping_add(offset);
                self.dynamic_jump(address)
            }
            Instruction::Load(width, ra, address) => {
                let loaded = match width {
                    Width::U8 => self.memory.read_uint::<1>(address),
                    Width::U32 => self.memory.read_uint::<4>(address),
                    Width::U64 => self.memory.read_uint::<8>(address),
                };
                match loaded {
                    Ok(value) => {
                        self.registers[ra] = value;
                        Step::Next(next)
                    }
                    Err(fault) => Step::Exit(fault.exit_reason()),
                }
            }
            Instruction::Store(width, ra, address) => {
                let value = regs[ra];
                let stored = match width {
                    Width::U8 => self.memory.write_uint::<1>(address, value),
                    Width::U32 => self.memory.write_uint::<4>(address, value),
                    Width::U64 => self.memory.write_uint::<8>(address, value),
                };
                match stored {
                    Ok(()) => Step::Next(next),
                    Err(fault) => Step::Exit(fault.exit_reason()),
                }
            }
            Instruction::BranchImm(cond, ra, imm, target) => {
                if cond.holds(regs[ra], imm) {
                    self.jump(target)
                } else {
                    Step::Next(next)
                }
            }
            Instruction::MoveReg(rd, ra) => {
                regs[rd] = regs[ra];
                Step::Next(next)
            }
            Instruction::AddImm64(rd, ra, imm) => {
                regs[rd] = regs[ra].wrapping_add(imm);
                Step::Next(next)
            }
            Instruction::Branch(cond, ra, rb, target) => {
                if cond.holds(regs[ra], regs[rb]) {
                    self.jump(target)
                } else {
                    Step::Next(next)
                }
            }
            Instruction::Arith(op, ra, rb, rd) => {
                regs[rd] = op.apply(regs[ra], regs[rb]);
                Step::Next(next)
            }
        }
    }

    /// Output of a halted program: the bytes addressed by the result registers, if readable.
    fn output(&self) -> Option<Vec<u8>> {
        let address = u32::try_from(self.registers[A0]).ok()?;
        let length = u32::try_from(self.registers[A1]).ok()?;
        self.memory.read(address, length).ok()
    }

    /// Finishes the run, producing the caller-visible result.
    pub fn into_result(self, exit_reason: ExitReason) -> VmExecutionResult {
        let output_data = if exit_reason == ExitReason::Halt { self.output() } else { None };
        VmExecutionResult {
            exit_reason,
            gas_used: self.gas.used(),
            output_data,
            final_registers: self.registers,
            final_pc: self.pc,
        }
    }
}

impl VmState for Vm {
    fn registers(&self) -> &Registers {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    fn read_memory(&self, address: u32, length: u32) -> Result<Vec<u8>, MemoryFault> {
        self.memory.read(address, length)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryFault> {
        self.memory.write(address, data)
    }

    fn gas_remaining(&self) -> Gas {
        self.gas.remaining()
    }

    fn consume_gas(&mut self, amount: u64) -> Result<(), OutOfGas> {
        self.gas.charge(amount)
    }

    fn pc(&self) -> u32 {
        self.pc
    }
}

/// Interprets `blob` from `pc` with the given budget.
///
/// A blob that fails to load is reported as a trap that consumed the whole budget.
pub fn interpret(
    blob: &[u8],
    pc: u32,
    gas: Gas,
    argument_data: Option<&[u8]>,
    ctx: Option<&mut dyn InvocationContext>,
) -> VmExecutionResult {
    match Vm::new(blob, pc, gas, argument_data) {
        Ok(mut vm) => {
            let reason = vm.run(ctx);
            vm.into_result(reason)
        }
        Err(err) => {
            tracing::debug!(target: "pvm::interpreter", %err, "failed to load program");
            VmExecutionResult::load_failure(pc, gas)
        }
    }
}
