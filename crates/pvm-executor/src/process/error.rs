use std::{io, path::PathBuf, time::Duration};

/// Errors raised while managing sandbox processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The socket pair for the IPC channel could not be created.
    #[error("failed to create socket pair: {0}")]
    SocketPair(#[source] io::Error),
    /// The child could not be started.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        /// The executable that was launched.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for process {pid}: {source}")]
    Wait {
        /// The child's pid.
        pid: i32,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The child did not exit in time. It has been terminated and reaped.
    #[error("process {pid} did not exit within {timeout:?}")]
    Timeout {
        /// The child's pid.
        pid: i32,
        /// The wait that expired.
        timeout: Duration,
    },
}

impl ProcessError {
    /// The OS error code behind a spawn or wait failure.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::SocketPair(source) | Self::Spawn { source, .. } | Self::Wait { source, .. } => {
                source.raw_os_error()
            }
            Self::Timeout { .. } => None,
        }
    }

    /// Whether this is a timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
