use std::time::Duration;

use crate::{ipc::IpcError, process::ProcessError};

/// Errors raised by the sandbox pool.
#[derive(Debug, thiserror::Error)]
pub enum SandboxPoolError {
    /// The configuration is inconsistent.
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),
    /// The pool no longer admits work.
    #[error("the sandbox pool is shut down")]
    Shutdown,
    /// Every worker is busy and the policy is to fail fast.
    #[error("no sandbox worker available")]
    Exhausted,
    /// Too many callers are already waiting.
    #[error("request queue is full: {depth} callers waiting")]
    QueueFull {
        /// Callers waiting when the request arrived.
        depth: usize,
    },
    /// No worker became available in time.
    #[error("no sandbox worker became available within {0:?}")]
    WaitTimeout(Duration),
    /// A worker could not be spawned.
    #[error("failed to spawn sandbox worker: {0}")]
    Spawn(#[from] ProcessError),
    /// The request failed on its worker.
    #[error("sandbox worker failed: {0}")]
    Worker(#[from] IpcError),
}
