use tracing::trace;

use crate::{
    backend_for, ExecutionMode, ExecutorBackend, ExecutorError, Invocation, InvocationContext,
    VmExecutionResult,
};

/// Runs programs on the calling thread with the backend selected by the mode.
#[derive(Debug)]
pub struct InProcessFrontend {
    mode: ExecutionMode,
    backend: Box<dyn ExecutorBackend>,
}

impl InProcessFrontend {
    /// Creates a frontend for `mode`. The `SANDBOXED` bit is ignored.
    pub fn new(mode: ExecutionMode) -> Self {
        let mode = mode.in_process();
        Self { mode, backend: backend_for(mode) }
    }

    /// The mode requests run with, without the sandbox bit.
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Executes `invocation`, handing host calls to `ctx`.
    pub fn execute(
        &self,
        invocation: Invocation<'_>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, ExecutorError> {
        trace!(target: "pvm::executor", pc = invocation.pc, gas = %invocation.gas, "executing in-process");
        Ok(self.backend.execute(invocation, ctx)?)
    }
}
