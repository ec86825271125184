//! `pvme`: runs PVM program blobs from the command line.

use std::process::ExitCode;

use clap::Parser;
use pvme::MainCmd;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    set_thread_panic_hook();
    match MainCmd::parse().run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Sets thread panic hook, so a panic in any thread ends the process with a backtrace.
fn set_thread_panic_hook() {
    use std::{
        backtrace::Backtrace,
        panic::{set_hook, take_hook},
        process::exit,
    };
    let orig_hook = take_hook();
    set_hook(Box::new(move |panic_info| {
        eprintln!("Custom backtrace: {}", Backtrace::capture());
        orig_hook(panic_info);
        exit(1);
    }));
}
