//! Execution backends for PVM programs.
//!
//! An [`Executor`] runs a program blob either in the calling process, in a freshly spawned
//! sandbox process, or on a pool of warm sandbox processes. Sandboxed strategies fall back to
//! in-process execution whenever the sandbox cannot deliver a result, so the outcome of a run
//! never depends on the strategy that produced it.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod constants;

mod backend;
pub use backend::*;

mod context;
pub use context::*;

mod executor;
pub use executor::*;

mod exit;
pub use exit::*;

mod frontend;
pub use frontend::*;

mod gas;
pub use gas::*;

pub mod interpreter;
pub mod ipc;

mod mode;
pub use mode::*;

pub mod pool;
pub mod process;

mod result;
pub use result::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
