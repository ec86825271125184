use std::io;

use tracing::debug;

/// Kernel-enforced limits applied to the worker before it serves requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time in seconds. The kernel sends `SIGXCPU` and then `SIGKILL` once it is used up.
    pub cpu_seconds: Option<u64>,
    /// Address space in bytes. Allocations beyond it fail.
    pub memory_bytes: Option<u64>,
}

/// Error raised when a limit cannot be installed.
#[derive(Debug, thiserror::Error)]
#[error("failed to limit {resource} to {value}: {source}")]
pub struct LimitError {
    /// The limited resource.
    pub resource: &'static str,
    /// The requested limit.
    pub value: u64,
    /// The underlying OS error.
    #[source]
    pub source: io::Error,
}

impl ResourceLimits {
    /// Installs the configured limits on the current process.
    ///
    /// Both the soft and the hard limit are set, so the worker cannot raise them again. A limit
    /// above the current hard limit is clamped to it.
    pub fn apply(&self) -> Result<(), LimitError> {
        if let Some(value) = self.cpu_seconds {
            let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
            // SAFETY: `limit` is a valid out pointer for the duration of the call.
            let rc = unsafe { libc::getrlimit(libc::RLIMIT_CPU, &mut limit) };
            check(rc, "cpu time", value)?;
            let capped = clamp(value, limit.rlim_max);
            let limit = libc::rlimit { rlim_cur: capped, rlim_max: capped };
            // SAFETY: `limit` is a valid pointer for the duration of the call.
            let rc = unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) };
            check(rc, "cpu time", value)?;
            debug!(target: "pvm::sandbox", seconds = value, "limited cpu time");
        }
        if let Some(value) = self.memory_bytes {
            let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
            // SAFETY: `limit` is a valid out pointer for the duration of the call.
            let rc = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) };
            check(rc, "address space", value)?;
            let capped = clamp(value, limit.rlim_max);
            let limit = libc::rlimit { rlim_cur: capped, rlim_max: capped };
            // SAFETY: `limit` is a valid pointer for the duration of the call.
            let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
            check(rc, "address space", value)?;
            debug!(target: "pvm::sandbox", bytes = value, "limited address space");
        }
        Ok(())
    }
}

fn clamp(value: u64, hard: libc::rlim_t) -> libc::rlim_t {
    libc::rlim_t::try_from(value).map_or(hard, |value| value.min(hard))
}

fn check(rc: libc::c_int, resource: &'static str, value: u64) -> Result<(), LimitError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(LimitError { resource, value, source: io::Error::last_os_error() })
    }
}
