//! Tuning knobs of the sandbox pool.

use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{constants::process::SPAWN_GRACE, pool::SandboxPoolError};

/// What a caller experiences when every regular worker is busy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait for a worker, bounded by the queue depth and the worker wait timeout.
    #[default]
    Queue,
    /// Fail immediately.
    FailFast,
    /// Run on a temporary extra worker, falling back to queueing once the overflow limit is
    /// reached.
    SpawnOverflow,
}

/// (De)serializes a [`Duration`] as fractional seconds.
mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Duration::try_from_secs_f64(f64::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}

/// Configuration of a [`SandboxPool`](crate::pool::SandboxPool).
///
/// Missing fields take their [`Default`] values when deserializing; durations are given in
/// seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPoolConfiguration {
    /// Number of regular workers.
    pub pool_size: usize,
    /// Maximum number of callers waiting for a worker.
    pub max_queue_depth: usize,
    /// How long a queued caller waits for a worker.
    #[serde(with = "seconds")]
    pub worker_wait_timeout: Duration,
    /// Upper bound of one request/response round trip.
    #[serde(with = "seconds")]
    pub execution_timeout: Duration,
    /// Whether workers are replaced after [`Self::worker_recycle_threshold`] executions.
    pub enable_worker_recycling: bool,
    /// Executions after which a worker is replaced.
    pub worker_recycle_threshold: u64,
    /// Interval of the idle worker health check. Zero disables it.
    #[serde(with = "seconds")]
    pub health_check_interval: Duration,
    /// Failed executions after which a worker is retired, either in a row or within
    /// [`Self::failure_tracking_window`].
    pub max_consecutive_failures: u32,
    /// How long failures are remembered, for worker retirement and the pool's failure rate.
    #[serde(with = "seconds")]
    pub failure_tracking_window: Duration,
    /// Whether temporary workers may be spawned when the pool is exhausted.
    pub allow_overflow_workers: bool,
    /// Maximum number of concurrent temporary workers.
    pub max_overflow_workers: usize,
    /// Behaviour when every regular worker is busy.
    pub exhaustion_policy: ExhaustionPolicy,
    /// Sandbox executable. Resolved from the environment when unset.
    pub sandbox_path: Option<PathBuf>,
    /// Time a new worker is given to start serving.
    #[serde(with = "seconds")]
    pub spawn_grace: Duration,
    /// How long shutdown waits for in-flight executions before killing their workers.
    #[serde(with = "seconds")]
    pub shutdown_grace: Duration,
}

impl Default for SandboxPoolConfiguration {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_queue_depth: 64,
            worker_wait_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
            enable_worker_recycling: true,
            worker_recycle_threshold: 1_000,
            health_check_interval: Duration::from_secs(10),
            max_consecutive_failures: 3,
            failure_tracking_window: Duration::from_secs(60),
            allow_overflow_workers: false,
            max_overflow_workers: 2,
            exhaustion_policy: ExhaustionPolicy::Queue,
            sandbox_path: None,
            spawn_grace: SPAWN_GRACE,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get)
}

impl SandboxPoolConfiguration {
    /// Many workers and deep queues, for batch workloads.
    pub fn throughput_optimized() -> Self {
        let pool_size = cpu_count() * 2;
        Self {
            pool_size,
            max_queue_depth: 1_024,
            worker_wait_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(60),
            worker_recycle_threshold: 10_000,
            health_check_interval: Duration::from_secs(30),
            allow_overflow_workers: true,
            max_overflow_workers: pool_size / 2,
            exhaustion_policy: ExhaustionPolicy::SpawnOverflow,
            ..Default::default()
        }
    }

    /// One worker per core, short queues and fast failure.
    pub fn latency_optimized() -> Self {
        Self {
            pool_size: cpu_count(),
            max_queue_depth: 16,
            worker_wait_timeout: Duration::from_millis(100),
            execution_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(1),
            exhaustion_policy: ExhaustionPolicy::FailFast,
            ..Default::default()
        }
    }

    /// Few, frequently recycled workers.
    pub fn memory_efficient() -> Self {
        Self {
            pool_size: 2,
            max_queue_depth: 256,
            worker_wait_timeout: Duration::from_secs(60),
            worker_recycle_threshold: 100,
            ..Default::default()
        }
    }

    /// A single long-lived worker with generous timeouts and no background checks.
    pub fn development() -> Self {
        Self {
            pool_size: 1,
            max_queue_depth: 8,
            worker_wait_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(120),
            enable_worker_recycling: false,
            health_check_interval: Duration::ZERO,
            max_consecutive_failures: 10,
            ..Default::default()
        }
    }

    /// Checks that the settings are usable together.
    pub fn validate(&self) -> Result<(), SandboxPoolError> {
        let invalid = |reason: &str| Err(SandboxPoolError::InvalidConfiguration(reason.to_string()));
        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1");
        }
        if self.max_queue_depth == 0 && self.exhaustion_policy != ExhaustionPolicy::FailFast {
            return invalid("max_queue_depth must be at least 1 unless failing fast");
        }
        if self.worker_wait_timeout.is_zero() || self.execution_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        if self.enable_worker_recycling && self.worker_recycle_threshold == 0 {
            return invalid("worker_recycle_threshold must be positive when recycling is enabled");
        }
        if self.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be at least 1");
        }
        if self.failure_tracking_window.is_zero() {
            return invalid("failure_tracking_window must be positive");
        }
        if self.exhaustion_policy == ExhaustionPolicy::SpawnOverflow &&
            (!self.allow_overflow_workers || self.max_overflow_workers == 0)
        {
            return invalid("the spawn_overflow policy needs overflow workers to be allowed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            SandboxPoolConfiguration::default(),
            SandboxPoolConfiguration::throughput_optimized(),
            SandboxPoolConfiguration::latency_optimized(),
            SandboxPoolConfiguration::memory_efficient(),
            SandboxPoolConfiguration::development(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_invalid_configurations() {
        let zero_pool = SandboxPoolConfiguration { pool_size: 0, ..Default::default() };
        assert!(matches!(zero_pool.validate(), Err(SandboxPoolError::InvalidConfiguration(_))));

        let overflow_disallowed = SandboxPoolConfiguration {
            exhaustion_policy: ExhaustionPolicy::SpawnOverflow,
            allow_overflow_workers: false,
            ..Default::default()
        };
        assert!(overflow_disallowed.validate().is_err());

        let no_window =
            SandboxPoolConfiguration { failure_tracking_window: Duration::ZERO, ..Default::default() };
        assert!(no_window.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SandboxPoolConfiguration = serde_json::from_str(
            r#"{ "pool_size": 8, "execution_timeout": 2.5, "exhaustion_policy": "fail_fast",
                 "failure_tracking_window": 0.5 }"#,
        )
        .unwrap();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.execution_timeout, Duration::from_millis(2_500));
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::FailFast);
        assert_eq!(config.failure_tracking_window, Duration::from_millis(500));
        assert_eq!(config.max_queue_depth, SandboxPoolConfiguration::default().max_queue_depth);
    }
}
