//! The outcome of one execution.

use serde::{Deserialize, Serialize};

use crate::{constants::vm::REGISTER_COUNT, ExitReason, Gas};

/// The register file of the VM.
pub type Registers = [u64; REGISTER_COUNT];

/// The outcome of one execution, produced once per call and owned by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmExecutionResult {
    /// Why the program stopped.
    pub exit_reason: ExitReason,
    /// Gas consumed by the run. Never exceeds the granted gas.
    pub gas_used: Gas,
    /// Output bytes, only present when the program halted with a readable output range.
    pub output_data: Option<Vec<u8>>,
    /// Registers at the point the program stopped.
    pub final_registers: Registers,
    /// Program counter at the point the program stopped.
    pub final_pc: u32,
}

impl VmExecutionResult {
    /// The result of a program that could not even be loaded: a trap with all gas consumed.
    pub const fn load_failure(pc: u32, gas: Gas) -> Self {
        Self {
            exit_reason: ExitReason::TRAP,
            gas_used: gas,
            output_data: None,
            final_registers: [0; REGISTER_COUNT],
            final_pc: pc,
        }
    }

    /// Whether the program halted normally.
    pub fn is_halt(&self) -> bool {
        self.exit_reason == ExitReason::Halt
    }
}
