use clap::{Parser, ValueEnum};
use pvm_executor::test_utils::{
    add_program, echo_program, infinite_loop_program, sum_to_n_program,
};

use crate::common::{encode_hex, Result};

/// The built-in demo programs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Program {
    /// Computes 100 + 42 into r7 and halts
    #[default]
    Add,
    /// Returns its argument data as output
    Echo,
    /// Sums 1..=n into r7
    SumToN,
    /// Jumps to itself until gas runs out
    Loop,
}

impl Program {
    /// Assembles the program blob.
    pub fn assemble(self, n: i32) -> Vec<u8> {
        match self {
            Self::Add => add_program(),
            Self::Echo => echo_program(),
            Self::SumToN => sum_to_n_program(n),
            Self::Loop => infinite_loop_program(),
        }
    }
}

/// Print the blob of a demo program as hex
#[derive(Parser, Debug)]
pub struct Cmd {
    /// Program to assemble
    #[arg(long = "program", value_enum, default_value_t = Program::Add)]
    pub program: Program,

    /// Loop bound of `sum-to-n`
    #[arg(long = "n", default_value = "10")]
    pub n: i32,
}

impl Cmd {
    /// Execute the assemble command
    pub fn run(&self) -> Result<()> {
        println!("{}", encode_hex(&self.program.assemble(self.n)));
        Ok(())
    }
}
