use std::{
    collections::VecDeque,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    constants::process::TERMINATION_GRACE,
    ipc::{ExecuteRequest, IpcClient, IpcError},
    pool::{SandboxPoolConfiguration, SandboxPoolError},
    process::{ChildProcessManager, ProcessGuard, ProcessHandle, Signal},
    VmExecutionResult,
};

/// Failed requests of one worker, by streak and by time.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FailureHistory {
    consecutive: u32,
    recent: VecDeque<Instant>,
}

impl FailureHistory {
    pub(crate) fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) fn record_failure(&mut self, now: Instant, window: Duration) {
        self.consecutive += 1;
        self.recent.push_back(now);
        self.forget_before(now, window);
    }

    fn forget_before(&mut self, now: Instant, window: Duration) {
        while self.recent.front().is_some_and(|at| now.saturating_duration_since(*at) > window) {
            self.recent.pop_front();
        }
    }

    /// Failures within `window` of `now`.
    pub(crate) fn recent(&mut self, now: Instant, window: Duration) -> usize {
        self.forget_before(now, window);
        self.recent.len()
    }

    /// Whether `max` failures happened in a row, or within `window` of `now`.
    pub(crate) fn exceeds(&mut self, max: u32, now: Instant, window: Duration) -> bool {
        self.consecutive >= max || self.recent(now, window) >= max as usize
    }
}

/// One warm sandbox process and its channel.
///
/// The worker owns a [`ProcessGuard`] for its child, so a worker that is dropped without being
/// terminated, e.g. by a cancelled request, takes its child down with it.
#[derive(Debug)]
pub struct SandboxWorker {
    id: u64,
    guard: ProcessGuard,
    client: IpcClient,
    executions: u64,
    failures: FailureHistory,
    failure_window: Duration,
    spawned_at: Instant,
    overflow: bool,
}

impl SandboxWorker {
    /// Spawns a worker through `manager`.
    pub async fn spawn(
        id: u64,
        manager: &ChildProcessManager,
        executable: &Path,
        overflow: bool,
        failure_window: Duration,
    ) -> Result<Self, SandboxPoolError> {
        let (handle, stream) = manager.spawn(executable).await?;
        let guard = manager.guard(handle);
        let client = match IpcClient::from_std(stream) {
            Ok(client) => client,
            Err(err) => {
                manager.kill(handle, Signal::Kill).await;
                guard.disarm();
                return Err(err.into());
            }
        };
        debug!(target: "pvm::pool", id, pid = handle.pid, overflow, "worker spawned");
        Ok(Self {
            id,
            guard,
            client,
            executions: 0,
            failures: FailureHistory::default(),
            failure_window,
            spawned_at: Instant::now(),
            overflow,
        })
    }

    /// Pool-unique worker id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The child process serving this worker.
    pub const fn handle(&self) -> ProcessHandle {
        self.guard.handle()
    }

    /// Requests served, successfully or not.
    pub const fn executions(&self) -> u64 {
        self.executions
    }

    /// Failed requests since the last success.
    pub const fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive
    }

    /// Failed requests within the pool's failure tracking window.
    pub fn recent_failures(&mut self) -> usize {
        self.failures.recent(Instant::now(), self.failure_window)
    }

    /// Whether the worker only serves a single request while the pool is exhausted.
    pub const fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Time since the worker was spawned.
    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Runs one request, bounded by `timeout`.
    ///
    /// Only an error frame leaves the channel usable; any other error means the worker must be
    /// discarded.
    pub async fn execute(
        &mut self,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<VmExecutionResult, IpcError> {
        self.executions += 1;
        let outcome = match tokio::time::timeout(timeout, self.client.execute(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(IpcError::Timeout(timeout)),
        };
        match outcome {
            Ok(response) => {
                self.failures.record_success();
                Ok(response.into_result())
            }
            Err(err) => {
                self.failures.record_failure(Instant::now(), self.failure_window);
                Err(err)
            }
        }
    }

    /// Checks the worker answers a heartbeat within `timeout`.
    pub async fn ping(&mut self, timeout: Duration) -> Result<(), IpcError> {
        match tokio::time::timeout(timeout, self.client.heartbeat()).await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }

    /// Whether the worker is failing: `max_consecutive_failures` failed requests in a row, or
    /// that many within the failure tracking window.
    pub fn is_failing(&mut self, config: &SandboxPoolConfiguration) -> bool {
        self.failures.exceeds(config.max_consecutive_failures, Instant::now(), self.failure_window)
    }

    /// Whether the worker should be replaced instead of returned to the pool.
    pub fn should_retire(&mut self, config: &SandboxPoolConfiguration) -> bool {
        self.is_failing(config) ||
            (config.enable_worker_recycling && self.executions >= config.worker_recycle_threshold)
    }

    /// Closes the channel, letting the sandbox leave its serve loop, and reaps it.
    pub async fn terminate(self, manager: &ChildProcessManager) {
        let Self { id, guard, client, executions, .. } = self;
        let handle = guard.handle();
        drop(client);
        match manager.wait_for_exit(handle, TERMINATION_GRACE).await {
            Ok(code) => trace!(target: "pvm::pool", id, code, executions, "worker exited"),
            Err(err) if err.is_timeout() => {}
            Err(err) => {
                debug!(target: "pvm::pool", id, %err, "waiting for worker failed, killing it");
                manager.kill(handle, Signal::Kill).await;
            }
        }
        guard.disarm();
    }

    /// Kills the worker without waiting for it to finish its serve loop.
    pub async fn kill(self, manager: &ChildProcessManager) {
        let Self { id, guard, client, .. } = self;
        let handle = guard.handle();
        drop(client);
        debug!(target: "pvm::pool", id, pid = handle.pid, "killing worker");
        manager.kill(handle, Signal::Kill).await;
        guard.disarm();
    }
}
