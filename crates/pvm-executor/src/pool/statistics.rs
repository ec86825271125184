//! Pool observability.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::Serialize;

/// Counters the pool updates as it works. Serialized behind the pool's lock.
#[derive(Debug, Default, Clone)]
pub(crate) struct PoolCounters {
    pub(crate) workers_spawned: u64,
    pub(crate) workers_failed: u64,
    pub(crate) workers_recycled: u64,
    pub(crate) total_executions: u64,
    pub(crate) successful_executions: u64,
    pub(crate) failed_executions: u64,
    pub(crate) overflow_executions: u64,
    pub(crate) rejected_requests: u64,
    pub(crate) queued_acquisitions: u64,
    pub(crate) total_queue_wait: Duration,
    /// When each worker failure happened, oldest first.
    pub(crate) worker_failure_times: VecDeque<Instant>,
}

impl PoolCounters {
    /// Counts one failed worker at `now`, forgetting failures older than `window`.
    pub(crate) fn record_worker_failure(&mut self, now: Instant, window: Duration) {
        self.workers_failed += 1;
        self.worker_failure_times.push_back(now);
        self.forget_failures_before(now, window);
    }

    /// Worker failures within `window` of `now`.
    pub(crate) fn recent_worker_failures(&mut self, now: Instant, window: Duration) -> u64 {
        self.forget_failures_before(now, window);
        self.worker_failure_times.len() as u64
    }

    fn forget_failures_before(&mut self, now: Instant, window: Duration) {
        while self
            .worker_failure_times
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.worker_failure_times.pop_front();
        }
    }
}

/// A snapshot of the pool's state and history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SandboxPoolStatistics {
    /// Workers currently alive, idle or busy.
    pub total_workers: usize,
    /// Workers running a request.
    pub active_workers: usize,
    /// Workers waiting for a request.
    pub idle_workers: usize,
    /// Callers waiting for a worker.
    pub queued_requests: usize,
    /// Workers spawned since the pool started.
    pub workers_spawned: u64,
    /// Workers that failed to spawn or were killed after a failure.
    pub workers_failed: u64,
    /// Workers replaced after reaching the recycle threshold.
    pub workers_recycled: u64,
    /// Requests that reached a worker.
    pub total_executions: u64,
    /// Requests that produced a result.
    pub successful_executions: u64,
    /// Requests that failed on their worker.
    pub failed_executions: u64,
    /// Requests served by temporary overflow workers.
    pub overflow_executions: u64,
    /// Requests turned away because the pool was exhausted.
    pub rejected_requests: u64,
    /// Mean time callers queued for a worker.
    pub average_queue_wait: Duration,
    /// Worker failures within the failure tracking window.
    pub recent_worker_failures: u64,
    /// Length of the failure tracking window.
    pub failure_tracking_window: Duration,
    /// Time since the pool started.
    pub uptime: Duration,
}

impl SandboxPoolStatistics {
    pub(crate) fn new(
        counters: &mut PoolCounters,
        active_workers: usize,
        idle_workers: usize,
        queued_requests: usize,
        uptime: Duration,
        failure_tracking_window: Duration,
    ) -> Self {
        let recent_worker_failures =
            counters.recent_worker_failures(Instant::now(), failure_tracking_window);
        let average_queue_wait = match u32::try_from(counters.queued_acquisitions) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(count) => counters.total_queue_wait / count,
        };
        Self {
            total_workers: active_workers + idle_workers,
            active_workers,
            idle_workers,
            queued_requests,
            workers_spawned: counters.workers_spawned,
            workers_failed: counters.workers_failed,
            workers_recycled: counters.workers_recycled,
            total_executions: counters.total_executions,
            successful_executions: counters.successful_executions,
            failed_executions: counters.failed_executions,
            overflow_executions: counters.overflow_executions,
            rejected_requests: counters.rejected_requests,
            average_queue_wait,
            recent_worker_failures,
            failure_tracking_window,
            uptime,
        }
    }

    /// Worker failures per minute over the failure tracking window.
    pub fn worker_failure_rate(&self) -> f64 {
        let minutes = self.failure_tracking_window.as_secs_f64() / 60.0;
        if minutes == 0.0 {
            0.0
        } else {
            self.recent_worker_failures as f64 / minutes
        }
    }

    /// Fraction of live workers currently running a request, `0.0` without workers.
    pub fn utilization_rate(&self) -> f64 {
        if self.total_workers == 0 {
            0.0
        } else {
            self.active_workers as f64 / self.total_workers as f64
        }
    }

    /// Fraction of executions that succeeded, `1.0` before the first execution.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            1.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64
        }
    }

    /// Whether at most half of the executions failed.
    pub fn is_healthy(&self) -> bool {
        self.failed_executions * 2 <= self.total_executions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_average_queue_wait() {
        let mut counters = PoolCounters {
            queued_acquisitions: 4,
            total_queue_wait: Duration::from_millis(100),
            total_executions: 3,
            successful_executions: 1,
            failed_executions: 2,
            ..Default::default()
        };
        let stats =
            SandboxPoolStatistics::new(&mut counters, 1, 2, 0, Duration::from_secs(1), WINDOW);
        assert_eq!(stats.average_queue_wait, Duration::from_millis(25));
        assert_eq!(stats.total_workers, 3);
        assert!(!stats.is_healthy());
        assert!((stats.utilization_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fresh_pool_is_healthy() {
        let stats = SandboxPoolStatistics::new(
            &mut PoolCounters::default(),
            0,
            0,
            0,
            Duration::ZERO,
            WINDOW,
        );
        assert!(stats.is_healthy());
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.utilization_rate(), 0.0);
        assert_eq!(stats.worker_failure_rate(), 0.0);
    }

    #[test]
    fn test_worker_failure_rate_uses_window() {
        let mut counters = PoolCounters::default();
        let start = Instant::now();
        counters.record_worker_failure(start, WINDOW * 2);
        counters.record_worker_failure(start + Duration::from_secs(200), WINDOW * 2);
        counters.record_worker_failure(start + Duration::from_secs(210), WINDOW * 2);
        assert_eq!(counters.workers_failed, 3);
        assert_eq!(counters.recent_worker_failures(start + Duration::from_secs(210), WINDOW * 2), 2);

        let stats = SandboxPoolStatistics::new(&mut counters, 0, 0, 0, Duration::ZERO, WINDOW * 2);
        // two failures in a two minute window
        assert!((stats.worker_failure_rate() - 1.0).abs() < 1e-9);
    }
}
