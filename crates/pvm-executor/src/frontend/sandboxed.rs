use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    constants::process::SPAWN_GRACE,
    frontend::InProcessFrontend,
    ipc::{ExecuteRequest, ExecuteResponse, IpcClient, IpcError},
    process::{sandbox_executable, ChildProcessManager, ProcessError, Signal},
    ExecutionMode, ExecutorError, Invocation, InvocationContext, VmExecutionResult,
};

/// Settings of single-shot sandboxed execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxedConfig {
    /// Sandbox executable. Resolved from the environment when unset.
    pub executable: Option<PathBuf>,
    /// Time a fresh sandbox is given to start serving.
    pub spawn_grace: Duration,
    /// Upper bound of the request/response round trip.
    pub execution_timeout: Duration,
    /// Upper bound of the wait for the sandbox to exit after answering.
    pub exit_timeout: Duration,
}

impl Default for SandboxedConfig {
    fn default() -> Self {
        Self {
            executable: None,
            spawn_grace: SPAWN_GRACE,
            execution_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a sandboxed attempt was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Spawning or reaping the sandbox failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The channel failed or the sandbox reported an error.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Runs every program in a fresh sandbox process.
///
/// Any failure of the sandbox path, including a sandbox that cannot be spawned, falls back to
/// in-process execution, so callers observe the same [`VmExecutionResult`] either way.
/// Invocations with a host-call context are always run in-process, since the context lives in
/// this process.
#[derive(Debug)]
pub struct SandboxedFrontend {
    mode: ExecutionMode,
    config: SandboxedConfig,
    manager: ChildProcessManager,
    fallback: InProcessFrontend,
}

impl SandboxedFrontend {
    /// Creates a frontend for `mode`. Nothing is spawned until the first request.
    pub fn new(mode: ExecutionMode, config: SandboxedConfig) -> Self {
        Self {
            mode,
            manager: ChildProcessManager::with_spawn_grace(config.spawn_grace),
            fallback: InProcessFrontend::new(mode),
            config,
        }
    }

    /// The frontend's configuration.
    pub const fn config(&self) -> &SandboxedConfig {
        &self.config
    }

    /// The sandbox executable that will be spawned.
    pub fn executable(&self) -> &Path {
        self.config.executable.as_deref().unwrap_or_else(|| sandbox_executable())
    }

    /// The manager owning the spawned sandboxes.
    pub const fn manager(&self) -> &ChildProcessManager {
        &self.manager
    }

    /// Runs `invocation` in a fresh sandbox, falling back to in-process execution when a context
    /// is supplied or the sandbox fails.
    pub async fn execute(
        &self,
        invocation: Invocation<'_>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, ExecutorError> {
        if ctx.is_some() {
            debug!(target: "pvm::sandboxed", "host-call context supplied, executing in-process");
            return self.fallback.execute(invocation, ctx);
        }

        match self.execute_in_sandbox(invocation).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(target: "pvm::sandboxed", %err, "sandboxed execution failed, falling back to in-process");
                self.fallback.execute(invocation, None)
            }
        }
    }

    /// One spawn, round trip and reap.
    ///
    /// The sandbox is reaped before this returns, and also when the returned future is dropped
    /// early, e.g. by a caller's timeout.
    pub async fn execute_in_sandbox(
        &self,
        invocation: Invocation<'_>,
    ) -> Result<VmExecutionResult, SandboxError> {
        let (handle, stream) = self.manager.spawn(self.executable()).await?;
        let guard = self.manager.guard(handle);
        let request = ExecuteRequest::new(invocation, self.mode);

        let response = match self.round_trip(stream, &request).await {
            Ok(response) => response,
            Err(err) => {
                self.manager.kill(handle, Signal::Kill).await;
                guard.disarm();
                return Err(err.into());
            }
        };

        let exit = self.manager.wait_for_exit(handle, self.config.exit_timeout).await;
        if let Err(err) = &exit {
            if !err.is_timeout() {
                self.manager.kill(handle, Signal::Kill).await;
            }
        }
        guard.disarm();
        match exit {
            Ok(0) => {}
            Ok(code) => {
                debug!(target: "pvm::sandboxed", pid = handle.pid, code, "sandbox exited with non-zero status");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(response.into_result())
    }

    async fn round_trip(
        &self,
        stream: std::os::unix::net::UnixStream,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, IpcError> {
        let mut client = IpcClient::from_std(stream)?;
        let timeout = self.config.execution_timeout;
        // dropping the client on return closes the channel, so the sandbox leaves its loop
        match tokio::time::timeout(timeout, client.execute(request)).await {
            Ok(response) => response,
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::add_program, Gas};

    fn missing_sandbox() -> SandboxedFrontend {
        SandboxedFrontend::new(
            ExecutionMode::SANDBOXED,
            SandboxedConfig {
                executable: Some(PathBuf::from("/nonexistent/pvm-sandbox")),
                spawn_grace: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let frontend = missing_sandbox();
        let blob = add_program();
        let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
        assert!(matches!(
            frontend.execute_in_sandbox(invocation).await,
            Err(SandboxError::Process(ProcessError::Spawn { .. }))
        ));
        assert_eq!(frontend.manager().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_falls_back() {
        let frontend = missing_sandbox();
        let blob = add_program();
        let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
        let expected = InProcessFrontend::new(ExecutionMode::empty()).execute(invocation, None).unwrap();
        assert_eq!(frontend.execute(invocation, None).await.unwrap(), expected);
    }
}
