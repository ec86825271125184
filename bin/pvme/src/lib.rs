//! Command line runner for PVM program blobs.
//!
//! `pvme run` executes a blob under any execution mode and prints the result; `pvme
//! assemble-demo` prints the blobs of the built-in demo programs.

mod cmd;
pub use cmd::*;

/// Demo program assembly.
pub mod assemble;
/// Shared argument parsing, error and output helpers.
pub mod common;
/// Program execution.
pub mod run;
