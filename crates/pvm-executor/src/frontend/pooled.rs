use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    frontend::InProcessFrontend,
    pool::{SandboxPool, SandboxPoolConfiguration, SandboxPoolError, SandboxPoolStatistics},
    ExecutionMode, ExecutorError, Invocation, InvocationContext, VmExecutionResult,
};

/// Runs programs on a lazily started [`SandboxPool`].
///
/// The first request starts the pool with all of its workers. A failed start falls back to
/// in-process execution and is retried by the next request.
///
/// Like [`SandboxedFrontend`](crate::SandboxedFrontend), every pool failure other than shutdown
/// falls back to in-process execution, and host-call contexts are always served in-process.
#[derive(Debug)]
pub struct PooledFrontend {
    mode: ExecutionMode,
    config: SandboxPoolConfiguration,
    pool: OnceCell<Arc<SandboxPool>>,
    shut_down: AtomicBool,
    fallback: InProcessFrontend,
}

impl PooledFrontend {
    /// Creates a frontend whose pool is started by the first request.
    pub fn new(mode: ExecutionMode, config: SandboxPoolConfiguration) -> Self {
        Self {
            mode,
            config,
            pool: OnceCell::new(),
            shut_down: AtomicBool::new(false),
            fallback: InProcessFrontend::new(mode),
        }
    }

    /// The pool, if a request has started it.
    pub fn pool(&self) -> Option<&Arc<SandboxPool>> {
        self.pool.get()
    }

    async fn started_pool(&self) -> Result<&Arc<SandboxPool>, SandboxPoolError> {
        self.pool.get_or_try_init(|| SandboxPool::start(self.config.clone(), self.mode)).await
    }

    /// Runs `invocation` on a pooled worker, or in-process if a context is supplied or the
    /// pool cannot deliver a result.
    pub async fn execute(
        &self,
        invocation: Invocation<'_>,
        ctx: Option<&mut dyn InvocationContext>,
    ) -> Result<VmExecutionResult, ExecutorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExecutorError::PoolShutdown);
        }
        if ctx.is_some() {
            debug!(target: "pvm::pool", "host-call context supplied, executing in-process");
            return self.fallback.execute(invocation, ctx);
        }

        let outcome = match self.started_pool().await {
            Ok(pool) => pool.execute(invocation).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(SandboxPoolError::Shutdown) => Err(ExecutorError::PoolShutdown),
            Err(err) => {
                warn!(target: "pvm::pool", %err, "pooled execution failed, falling back to in-process");
                self.fallback.execute(invocation, None)
            }
        }
    }

    /// Statistics of the pool, `None` before it started.
    pub fn statistics(&self) -> Option<SandboxPoolStatistics> {
        self.pool().map(|pool| pool.statistics())
    }

    /// Shuts the pool down. Later requests fail with [`ExecutorError::PoolShutdown`].
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        if let Some(pool) = self.pool() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::*;
    use crate::{test_utils::add_program, Gas};

    fn frontend() -> PooledFrontend {
        PooledFrontend::new(
            ExecutionMode::SANDBOXED,
            SandboxPoolConfiguration {
                pool_size: 1,
                sandbox_path: Some(PathBuf::from("/nonexistent/pvm-sandbox")),
                spawn_grace: Duration::ZERO,
                health_check_interval: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_failed_start_falls_back_and_retries() {
        let frontend = frontend();
        assert!(frontend.statistics().is_none());

        let blob = add_program();
        for _ in 0..2 {
            let invocation =
                Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
            let result = frontend.execute(invocation, None).await.unwrap();
            assert!(result.is_halt());
            assert!(frontend.pool().is_none());
        }
    }

    #[tokio::test]
    async fn test_first_request_warms_the_pool() {
        let frontend = PooledFrontend::new(
            ExecutionMode::SANDBOXED,
            SandboxPoolConfiguration {
                pool_size: 2,
                sandbox_path: Some(PathBuf::from("cat")),
                spawn_grace: Duration::ZERO,
                health_check_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        let pool = frontend.started_pool().await.unwrap();
        assert_eq!(pool.statistics().idle_workers, 2);
        frontend.shutdown().await;
        assert_eq!(frontend.statistics().unwrap().total_workers, 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let frontend = frontend();
        frontend.shutdown().await;
        let blob = add_program();
        let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
        assert!(matches!(
            frontend.execute(invocation, None).await,
            Err(ExecutorError::PoolShutdown)
        ));
    }
}
