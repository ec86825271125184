use tracing::debug;

use crate::{
    pool::{SandboxPoolConfiguration, SandboxPoolStatistics},
    BackendError, ExecutionMode, ExecutorKind, Gas, InProcessFrontend, Invocation,
    InvocationContext, PooledFrontend, SandboxedConfig, SandboxedFrontend, VmExecutionResult,
};

/// Errors surfaced by [`Executor::execute`].
///
/// Everything that can go wrong on a sandboxed path is absorbed by falling back to in-process
/// execution; only conditions that no strategy can recover from reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The JIT backend was requested but is not available.
    #[error("the JIT backend is not implemented")]
    JitUnavailable,
    /// The pool was shut down.
    #[error("the sandbox pool has been shut down")]
    PoolShutdown,
}

impl From<BackendError> for ExecutorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::JitUnavailable => Self::JitUnavailable,
        }
    }
}

/// Everything needed to build an [`Executor`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutorConfig {
    /// Backend and isolation flags.
    pub mode: ExecutionMode,
    /// Settings of single-shot sandboxing.
    pub sandbox: SandboxedConfig,
    /// Pool settings. When set, sandboxed modes run on a pool instead of spawning per call.
    pub pool: Option<SandboxPoolConfiguration>,
}

impl ExecutorConfig {
    /// The configuration for `mode` with default sandbox settings and no pool.
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode, ..Default::default() }
    }
}

#[derive(Debug)]
enum Frontend {
    InProcess(InProcessFrontend),
    Sandboxed(SandboxedFrontend),
    Pooled(PooledFrontend),
}

/// Runs PVM programs with the strategy chosen by its [`ExecutionMode`].
///
/// # Example
///
/// ```
/// # tokio_test_block_on(async {
/// use pvm_executor::{ExecutionMode, Executor, Gas};
///
/// let executor = Executor::new(ExecutionMode::empty());
/// // a program consisting of a single `trap`
/// let result = executor.execute(&[0, 0, 1, 0, 1], 0, Gas::new(10), None, None).await.unwrap();
/// assert_eq!(result.gas_used, Gas::new(1));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct Executor {
    mode: ExecutionMode,
    kind: ExecutorKind,
    frontend: Frontend,
}

impl Executor {
    /// An executor for `mode`, spawning one sandbox per call when the mode is sandboxed.
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_config(ExecutorConfig::new(mode))
    }

    /// An executor for `mode` that runs sandboxed calls on a pool configured by `pool`.
    pub fn pooled(mode: ExecutionMode, pool: SandboxPoolConfiguration) -> Self {
        Self::with_config(ExecutorConfig { mode, pool: Some(pool), ..Default::default() })
    }

    /// Wires the executor described by `config`.
    pub fn with_config(config: ExecutorConfig) -> Self {
        let ExecutorConfig { mode, sandbox, pool } = config;
        let kind = ExecutorKind::select(mode, pool.is_some());
        let frontend = match kind {
            ExecutorKind::InProcessInterpreter | ExecutorKind::InProcessJit => {
                Frontend::InProcess(InProcessFrontend::new(mode))
            }
            ExecutorKind::Sandboxed => Frontend::Sandboxed(SandboxedFrontend::new(mode, sandbox)),
            ExecutorKind::PooledSandboxed => {
                Frontend::Pooled(PooledFrontend::new(mode, pool.unwrap_or_default()))
            }
        };
        debug!(target: "pvm::executor", %kind, mode = mode.raw(), "created executor");
        Self { mode, kind, frontend }
    }

    /// The mode this executor was created with.
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The strategy this executor uses.
    pub const fn kind(&self) -> ExecutorKind {
        self.kind
    }

    /// Runs `blob` from `pc` with a budget of `gas`.
    ///
    /// Host calls are handed to `ctx`; without one, the first host call ends execution with
    /// [`ExitReason::HostCall`](crate::ExitReason::HostCall). Sandboxed strategies run
    /// invocations with a context in-process.
    ///
    /// # Errors
    ///
    /// Only [`ExecutorError`] conditions; program failures are reported in the result.
    pub async fn execute(
        &self,
        blob: &[u8],
        pc: u32,
        gas: Gas,
        argument_data: Option<&[u8]>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, ExecutorError> {
        let invocation = Invocation { blob, pc, gas, argument_data };
        match &self.frontend {
            Frontend::InProcess(frontend) => frontend.execute(invocation, ctx),
            Frontend::Sandboxed(frontend) => frontend.execute(invocation, ctx).await,
            Frontend::Pooled(frontend) => frontend.execute(invocation, ctx).await,
        }
    }

    /// Pool statistics, for a pooled executor whose pool has started.
    pub fn statistics(&self) -> Option<SandboxPoolStatistics> {
        match &self.frontend {
            Frontend::Pooled(frontend) => frontend.statistics(),
            Frontend::InProcess(_) | Frontend::Sandboxed(_) => None,
        }
    }

    /// Releases sandbox processes. Pooled executors reject requests afterwards.
    pub async fn shutdown(&self) {
        match &self.frontend {
            Frontend::InProcess(_) => {}
            Frontend::Sandboxed(frontend) => frontend.manager().cleanup().await,
            Frontend::Pooled(frontend) => frontend.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_mode() {
        assert_eq!(Executor::new(ExecutionMode::empty()).kind(), ExecutorKind::InProcessInterpreter);
        assert_eq!(Executor::new(ExecutionMode::JIT).kind(), ExecutorKind::InProcessJit);
        assert_eq!(Executor::new(ExecutionMode::SANDBOXED).kind(), ExecutorKind::Sandboxed);
        assert_eq!(
            Executor::pooled(ExecutionMode::SANDBOXED, SandboxPoolConfiguration::development())
                .kind(),
            ExecutorKind::PooledSandboxed
        );
        assert_eq!(
            Executor::pooled(ExecutionMode::empty(), SandboxPoolConfiguration::default()).kind(),
            ExecutorKind::InProcessInterpreter
        );
    }

    #[test]
    fn test_backend_error_conversion() {
        assert_eq!(ExecutorError::from(BackendError::JitUnavailable), ExecutorError::JitUnavailable);
    }
}
