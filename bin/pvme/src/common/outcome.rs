use std::time::Duration;

use pvm_executor::{ExecutorKind, Registers, VmExecutionResult};
use serde::Serialize;

use super::encode_hex;

/// The printable outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    /// The strategy the run was wired with.
    pub executor: String,
    /// Why the program stopped, in display form.
    pub exit_reason: String,
    /// The wire exit code.
    pub exit_code: u64,
    /// Gas consumed.
    pub gas_used: u64,
    /// Hex-encoded output, if any.
    pub output: Option<String>,
    /// Program counter at exit.
    pub final_pc: u32,
    /// Register file at exit.
    pub registers: Registers,
    /// Wall time of the (average) run in microseconds.
    pub elapsed_micros: u128,
}

impl RunOutput {
    /// Builds the printable form of `result`.
    pub fn new(kind: ExecutorKind, result: &VmExecutionResult, elapsed: Duration) -> Self {
        Self {
            executor: kind.to_string(),
            exit_reason: result.exit_reason.to_string(),
            exit_code: result.exit_reason.to_code(),
            gas_used: result.gas_used.get(),
            output: result.output_data.as_deref().map(encode_hex),
            final_pc: result.final_pc,
            registers: result.final_registers,
            elapsed_micros: elapsed.as_micros(),
        }
    }
}
