use clap::Parser;

use crate::common::Result;

/// Main command enumeration for the pvme CLI tool
#[derive(Parser, Debug)]
#[command(infer_subcommands = true, version)]
pub enum MainCmd {
    /// Run a program blob
    Run(crate::run::Cmd),
    /// Print the blob of a demo program as hex
    AssembleDemo(crate::assemble::Cmd),
}

impl MainCmd {
    /// Execute the main command
    pub async fn run(&self) -> Result<()> {
        match self {
            Self::Run(cmd) => cmd.run().await,
            Self::AssembleDemo(cmd) => cmd.run(),
        }
    }
}
