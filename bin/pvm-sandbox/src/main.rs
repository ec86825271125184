//! `pvm-sandbox`: serves PVM execute requests on descriptor 0.

use std::process::ExitCode;

use clap::Parser;
use pvm_executor::ipc::ServerExit;
use pvm_sandbox::SandboxArgs;

fn main() -> ExitCode {
    let args = SandboxArgs::parse();
    match pvm_sandbox::run(&args) {
        Ok(ServerExit::PeerClosed) => ExitCode::SUCCESS,
        Ok(ServerExit::PeerError(_)) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("pvm-sandbox: {err}");
            ExitCode::FAILURE
        }
    }
}
