//! In-process instruction execution backends.

use core::fmt::Debug;

use auto_impl::auto_impl;

use crate::{interpreter, ExecutionMode, Gas, InvocationContext, VmExecutionResult};

/// The arguments of one execution, borrowed from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation<'a> {
    /// The encoded program.
    pub blob: &'a [u8],
    /// The code offset to start at.
    pub pc: u32,
    /// The gas budget.
    pub gas: Gas,
    /// Bytes mapped into the argument region.
    pub argument_data: Option<&'a [u8]>,
}

/// Errors raised by a backend itself, as opposed to outcomes of the program it runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The JIT backend was selected but no code generator exists.
    #[error("the JIT backend is not implemented")]
    JitUnavailable,
}

/// Runs programs inside the calling process.
#[auto_impl(&, Box, Arc)]
pub trait ExecutorBackend: Debug + Send + Sync {
    /// Executes `invocation`, handing host calls to `ctx`.
    fn execute(
        &self,
        invocation: Invocation<'_>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, BackendError>;
}

/// The interpreter backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterBackend;

impl ExecutorBackend for InterpreterBackend {
    fn execute(
        &self,
        invocation: Invocation<'_>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, BackendError> {
        Ok(interpreter::interpret(
            invocation.blob,
            invocation.pc,
            invocation.gas,
            invocation.argument_data,
            ctx,
        ))
    }
}

/// The slot for a compiling backend. Every call fails with [`BackendError::JitUnavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JitBackend;

impl ExecutorBackend for JitBackend {
    fn execute(
        &self,
        _invocation: Invocation<'_>,
        _ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, BackendError> {
        tracing::error!(target: "pvm::backend", "JIT backend invoked but not implemented");
        Err(BackendError::JitUnavailable)
    }
}

/// The backend selected by the `JIT` bit of `mode`.
pub fn backend_for(mode: ExecutionMode) -> Box<dyn ExecutorBackend> {
    if mode.contains(ExecutionMode::JIT) {
        Box::new(JitBackend)
    } else {
        Box::new(InterpreterBackend)
    }
}
