use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::{
    sync::{Semaphore, SemaphorePermit, TryAcquireError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    constants::process::TERMINATION_POLL_INTERVAL,
    ipc::{ExecuteRequest, IpcError},
    pool::{
        statistics::PoolCounters, ExhaustionPolicy, SandboxPoolConfiguration, SandboxPoolError,
        SandboxPoolStatistics, SandboxWorker,
    },
    process::{sandbox_executable, ChildProcessManager},
    ExecutionMode, Invocation, VmExecutionResult,
};

/// Upper bound of a health check heartbeat.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a gauge incremented for as long as it lives.
#[derive(Debug)]
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    /// Increments `gauge`, returning the guard and the previous value.
    fn enter(gauge: &'a AtomicUsize) -> (Self, usize) {
        let previous = gauge.fetch_add(1, Ordering::AcqRel);
        (Self(gauge), previous)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The right to run one request.
#[derive(Debug)]
enum Slot<'a> {
    /// One of the `pool_size` regular slots.
    Regular(SemaphorePermit<'a>),
    /// A temporary slot beyond the pool size.
    Overflow(GaugeGuard<'a>),
}

impl Slot<'_> {
    const fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow(_))
    }
}

/// A bounded set of warm sandbox workers shared by concurrent callers.
///
/// At most `pool_size` requests run on regular workers at a time. Callers beyond that are
/// queued in arrival order, rejected or given a temporary worker, depending on the
/// [`ExhaustionPolicy`]. A pool created with [`Self::start`] spawns its workers up front; missing
/// workers are spawned on demand, kept warm between requests and replaced when they fail or
/// reach the recycle threshold. Every worker process is owned by the pool's
/// own [`ChildProcessManager`], so dropping the pool kills whatever is still running.
#[derive(Debug)]
pub struct SandboxPool {
    config: SandboxPoolConfiguration,
    mode: ExecutionMode,
    executable: PathBuf,
    manager: ChildProcessManager,
    idle: Mutex<VecDeque<SandboxWorker>>,
    permits: Semaphore,
    active: AtomicUsize,
    waiting: AtomicUsize,
    overflow_in_use: AtomicUsize,
    next_worker_id: AtomicU64,
    counters: Mutex<PoolCounters>,
    shutting_down: AtomicBool,
    started_at: Instant,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    /// Creates a pool running requests with `mode`, spawning `pool_size` workers before it
    /// returns.
    ///
    /// If any worker fails to spawn, the ones already running are terminated and the spawn error
    /// is returned.
    pub async fn start(
        config: SandboxPoolConfiguration,
        mode: ExecutionMode,
    ) -> Result<Arc<Self>, SandboxPoolError> {
        let pool = Self::new(config, mode)?;
        if let Err(err) = pool.warm_up().await {
            warn!(target: "pvm::pool", %err, "failed to spawn initial workers");
            pool.shutdown().await;
            return Err(err);
        }
        Ok(pool)
    }

    /// Creates a cold pool running requests with `mode`.
    ///
    /// No worker is spawned until the first request. When called inside a Tokio runtime and
    /// `health_check_interval` is non-zero, a background task periodically checks idle workers;
    /// it holds only a weak reference and ends with the pool.
    pub fn new(
        config: SandboxPoolConfiguration,
        mode: ExecutionMode,
    ) -> Result<Arc<Self>, SandboxPoolError> {
        config.validate()?;
        let executable =
            config.sandbox_path.clone().unwrap_or_else(|| sandbox_executable().to_path_buf());
        info!(
            target: "pvm::pool",
            pool_size = config.pool_size,
            policy = ?config.exhaustion_policy,
            executable = %executable.display(),
            "starting sandbox pool"
        );

        let pool = Arc::new(Self {
            manager: ChildProcessManager::with_spawn_grace(config.spawn_grace),
            permits: Semaphore::new(config.pool_size),
            idle: Mutex::new(VecDeque::with_capacity(config.pool_size)),
            config,
            mode,
            executable,
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            overflow_in_use: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(1),
            counters: Mutex::new(PoolCounters::default()),
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
            health_task: Mutex::new(None),
        });
        *lock(&pool.health_task) = Self::spawn_health_task(&pool);
        Ok(pool)
    }

    async fn warm_up(&self) -> Result<(), SandboxPoolError> {
        debug!(target: "pvm::pool", count = self.config.pool_size, "spawning initial workers");
        while self.idle().len() < self.config.pool_size {
            let worker = match self.spawn_worker(false).await {
                Ok(worker) => worker,
                Err(err) => {
                    self.record_worker_failure();
                    return Err(err);
                }
            };
            self.idle().push_back(worker);
        }
        Ok(())
    }

    fn spawn_health_task(pool: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = pool.config.health_check_interval;
        if period.is_zero() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let pool = Arc::downgrade(pool);
        Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_shut_down() {
                    break;
                }
                pool.check_health().await;
            }
        }))
    }

    /// The pool's configuration.
    pub const fn config(&self) -> &SandboxPoolConfiguration {
        &self.config
    }

    /// The sandbox executable workers are spawned from.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether [`Self::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn counters(&self) -> MutexGuard<'_, PoolCounters> {
        lock(&self.counters)
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<SandboxWorker>> {
        lock(&self.idle)
    }

    fn record_worker_failure(&self) {
        self.counters()
            .record_worker_failure(Instant::now(), self.config.failure_tracking_window);
    }

    /// Runs `invocation` on a worker.
    ///
    /// A worker whose channel failed is killed and reaped, never retried; the caller decides
    /// whether to fall back. An error frame from the sandbox leaves the worker in the pool.
    pub async fn execute(
        &self,
        invocation: Invocation<'_>,
    ) -> Result<VmExecutionResult, SandboxPoolError> {
        if self.is_shut_down() {
            return Err(SandboxPoolError::Shutdown);
        }
        let slot = self.acquire().await?;
        let request = ExecuteRequest::new(invocation, self.mode);

        let worker = if slot.is_overflow() {
            self.spawn_worker(true).await
        } else {
            self.checkout().await
        };
        let mut worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                self.record_worker_failure();
                warn!(target: "pvm::pool", %err, "no worker for request");
                return Err(err);
            }
        };

        let (active, _) = GaugeGuard::enter(&self.active);
        let outcome = worker.execute(&request, self.config.execution_timeout).await;
        drop(active);
        {
            let mut counters = self.counters();
            counters.total_executions += 1;
            if slot.is_overflow() {
                counters.overflow_executions += 1;
            }
            if outcome.is_ok() {
                counters.successful_executions += 1;
            } else {
                counters.failed_executions += 1;
            }
        }

        match outcome {
            Ok(result) => {
                self.check_in(worker).await;
                Ok(result)
            }
            Err(err @ IpcError::ChildError(_)) => {
                debug!(target: "pvm::pool", id = worker.id(), %err, "sandbox rejected request");
                self.check_in(worker).await;
                Err(err.into())
            }
            Err(err) => {
                warn!(target: "pvm::pool", id = worker.id(), %err, "worker failed, discarding it");
                self.record_worker_failure();
                worker.kill(&self.manager).await;
                Err(err.into())
            }
        }
    }

    async fn acquire(&self) -> Result<Slot<'_>, SandboxPoolError> {
        match self.permits.try_acquire() {
            Ok(permit) => return Ok(Slot::Regular(permit)),
            Err(TryAcquireError::Closed) => return Err(SandboxPoolError::Shutdown),
            Err(TryAcquireError::NoPermits) => {}
        }

        match self.config.exhaustion_policy {
            ExhaustionPolicy::FailFast => {
                self.counters().rejected_requests += 1;
                debug!(target: "pvm::pool", "pool exhausted, failing fast");
                Err(SandboxPoolError::Exhausted)
            }
            ExhaustionPolicy::SpawnOverflow => match self.reserve_overflow() {
                Some(guard) => Ok(Slot::Overflow(guard)),
                None => self.wait_for_permit().await,
            },
            ExhaustionPolicy::Queue => self.wait_for_permit().await,
        }
    }

    fn reserve_overflow(&self) -> Option<GaugeGuard<'_>> {
        if !self.config.allow_overflow_workers {
            return None;
        }
        let max = self.config.max_overflow_workers;
        self.overflow_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| GaugeGuard(&self.overflow_in_use))
    }

    async fn wait_for_permit(&self) -> Result<Slot<'_>, SandboxPoolError> {
        let (waiting, depth) = GaugeGuard::enter(&self.waiting);
        if depth >= self.config.max_queue_depth {
            drop(waiting);
            self.counters().rejected_requests += 1;
            return Err(SandboxPoolError::QueueFull { depth });
        }

        let started = Instant::now();
        let timeout = self.config.worker_wait_timeout;
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                let mut counters = self.counters();
                counters.queued_acquisitions += 1;
                counters.total_queue_wait += started.elapsed();
                Ok(Slot::Regular(permit))
            }
            Ok(Err(_closed)) => Err(SandboxPoolError::Shutdown),
            Err(_) => {
                self.counters().rejected_requests += 1;
                Err(SandboxPoolError::WaitTimeout(timeout))
            }
        }
    }

    async fn checkout(&self) -> Result<SandboxWorker, SandboxPoolError> {
        let idle = self.idle().pop_front();
        if let Some(worker) = idle {
            return Ok(worker);
        }
        self.manager.reap_zombies();
        self.spawn_worker(false).await
    }

    async fn spawn_worker(&self, overflow: bool) -> Result<SandboxWorker, SandboxPoolError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = SandboxWorker::spawn(
            id,
            &self.manager,
            &self.executable,
            overflow,
            self.config.failure_tracking_window,
        )
        .await?;
        self.counters().workers_spawned += 1;
        Ok(worker)
    }

    /// Returns a worker after a request, or retires it.
    async fn check_in(&self, mut worker: SandboxWorker) {
        if worker.is_overflow() || self.is_shut_down() {
            worker.terminate(&self.manager).await;
            return;
        }
        if worker.should_retire(&self.config) {
            let failing = worker.is_failing(&self.config);
            if failing {
                self.record_worker_failure();
            } else {
                self.counters().workers_recycled += 1;
            }
            debug!(
                target: "pvm::pool",
                id = worker.id(),
                executions = worker.executions(),
                failing,
                "retiring worker"
            );
            worker.terminate(&self.manager).await;
            return;
        }
        self.idle().push_back(worker);
    }

    /// Pings every idle worker with a heartbeat and replaces the ones that do not answer.
    ///
    /// Workers are checked one at a time while holding a regular slot, so the check never
    /// competes with more than `pool_size` requests.
    ///
    /// # Returns
    ///
    /// The number of workers retired.
    pub async fn check_health(&self) -> usize {
        let candidates = self.idle().len();
        let timeout = self.config.worker_wait_timeout.min(HEARTBEAT_TIMEOUT);
        let mut retired = 0;
        for _ in 0..candidates {
            let Ok(permit) = self.permits.try_acquire() else { break };
            let worker = self.idle().pop_front();
            let Some(mut worker) = worker else { break };
            match worker.ping(timeout).await {
                Ok(()) => self.idle().push_back(worker),
                Err(err) => {
                    warn!(target: "pvm::pool", id = worker.id(), %err, "worker failed health check");
                    self.record_worker_failure();
                    worker.kill(&self.manager).await;
                    retired += 1;
                }
            }
            drop(permit);
        }
        self.manager.reap_zombies();
        retired
    }

    /// A snapshot of the pool's state.
    pub fn statistics(&self) -> SandboxPoolStatistics {
        let idle = self.idle().len();
        SandboxPoolStatistics::new(
            &mut self.counters(),
            self.active.load(Ordering::Acquire),
            idle,
            self.waiting.load(Ordering::Acquire),
            self.started_at.elapsed(),
            self.config.failure_tracking_window,
        )
    }

    /// Stops admitting work, waits up to `shutdown_grace` for in-flight requests and then
    /// terminates every worker. Queued callers fail with [`SandboxPoolError::Shutdown`].
    /// Calling it again has no effect.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "pvm::pool", "shutting down sandbox pool");
        self.permits.close();
        if let Some(task) = lock(&self.health_task).take() {
            task.abort();
        }

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while self.active.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(TERMINATION_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                target: "pvm::pool",
                active = self.active.load(Ordering::Acquire),
                "in-flight executions outlived the shutdown grace period"
            );
        }

        let idle: Vec<SandboxWorker> = self.idle().drain(..).collect();
        for worker in idle {
            worker.terminate(&self.manager).await;
        }
        self.manager.cleanup().await;
        debug!(target: "pvm::pool", statistics = ?self.statistics(), "sandbox pool stopped");
    }
}

impl Drop for SandboxPool {
    fn drop(&mut self) {
        if let Some(task) =
            self.health_task.get_mut().unwrap_or_else(PoisonError::into_inner).take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Gas;

    fn missing_sandbox() -> SandboxPoolConfiguration {
        SandboxPoolConfiguration {
            pool_size: 1,
            sandbox_path: Some(PathBuf::from("/nonexistent/pvm-sandbox")),
            spawn_grace: Duration::ZERO,
            health_check_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    /// `cat` reads requests and never answers, like a hung sandbox.
    fn unresponsive_sandbox(pool_size: usize) -> SandboxPoolConfiguration {
        SandboxPoolConfiguration {
            pool_size,
            sandbox_path: Some(PathBuf::from("cat")),
            ..missing_sandbox()
        }
    }

    async fn wait_until_untracked(pool: &SandboxPool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.manager.tracked_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.manager.tracked_count(), 0);
    }

    fn invocation() -> Invocation<'static> {
        Invocation { blob: &[0, 0, 0], pc: 0, gas: Gas::new(10), argument_data: None }
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let config = SandboxPoolConfiguration { pool_size: 0, ..missing_sandbox() };
        assert!(matches!(
            SandboxPool::new(config, ExecutionMode::SANDBOXED),
            Err(SandboxPoolError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_counted_and_releases_slot() {
        let pool = SandboxPool::new(missing_sandbox(), ExecutionMode::SANDBOXED).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                pool.execute(invocation()).await,
                Err(SandboxPoolError::Spawn(_))
            ));
        }
        let stats = pool.statistics();
        assert_eq!(stats.workers_failed, 2);
        assert_eq!(stats.recent_worker_failures, 2);
        assert!(stats.worker_failure_rate() > 0.0);
        assert_eq!(stats.total_workers, 0);
        assert_eq!(stats.total_executions, 0);
    }

    #[tokio::test]
    async fn test_start_spawns_workers_up_front() {
        let pool = SandboxPool::start(unresponsive_sandbox(2), ExecutionMode::SANDBOXED).await.unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.workers_spawned, 2);
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.utilization_rate(), 0.0);
        assert_eq!(pool.manager.tracked_count(), 2);

        pool.shutdown().await;
        assert_eq!(pool.statistics().total_workers, 0);
        assert_eq!(pool.manager.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_when_workers_cannot_spawn() {
        let config = SandboxPoolConfiguration { pool_size: 3, ..missing_sandbox() };
        assert!(matches!(
            SandboxPool::start(config, ExecutionMode::SANDBOXED).await,
            Err(SandboxPoolError::Spawn(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_request_reaps_its_worker() {
        let pool = SandboxPool::start(unresponsive_sandbox(1), ExecutionMode::SANDBOXED).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(200), pool.execute(invocation()))
            .await
            .is_err());

        wait_until_untracked(&pool).await;
        let stats = pool.statistics();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.total_workers, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = SandboxPool::new(missing_sandbox(), ExecutionMode::SANDBOXED).unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_shut_down());
        assert!(matches!(pool.execute(invocation()).await, Err(SandboxPoolError::Shutdown)));
    }

    #[tokio::test]
    async fn test_fail_fast_when_exhausted() {
        let config = SandboxPoolConfiguration {
            exhaustion_policy: ExhaustionPolicy::FailFast,
            ..missing_sandbox()
        };
        let pool = SandboxPool::new(config, ExecutionMode::SANDBOXED).unwrap();
        let _held = pool.permits.try_acquire().unwrap();
        assert!(matches!(pool.execute(invocation()).await, Err(SandboxPoolError::Exhausted)));
        assert_eq!(pool.statistics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_queue_wait_times_out() {
        let config = SandboxPoolConfiguration {
            worker_wait_timeout: Duration::from_millis(20),
            ..missing_sandbox()
        };
        let pool = SandboxPool::new(config, ExecutionMode::SANDBOXED).unwrap();
        let _held = pool.permits.try_acquire().unwrap();
        assert!(matches!(
            pool.execute(invocation()).await,
            Err(SandboxPoolError::WaitTimeout(_))
        ));
        assert_eq!(pool.statistics().queued_requests, 0);
    }
}
