use clap::Parser;

use crate::{LogArgs, ResourceLimits};

/// Environment variable holding the CPU time limit in seconds.
pub const CPU_SECONDS_ENV: &str = "PVM_SANDBOX_CPU_SECONDS";

/// Environment variable holding the address space limit in bytes.
pub const MEMORY_BYTES_ENV: &str = "PVM_SANDBOX_MEMORY_BYTES";

/// Command line of the sandbox worker. Controllers spawn it without arguments, so every option
/// can also be given through the environment.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about = "Serves PVM execute requests on descriptor 0")]
pub struct SandboxArgs {
    /// CPU time limit of the worker, in seconds
    #[arg(long = "cpu-seconds", env = CPU_SECONDS_ENV)]
    pub cpu_seconds: Option<u64>,

    /// Address space limit of the worker, in bytes
    #[arg(long = "memory-bytes", env = MEMORY_BYTES_ENV)]
    pub memory_bytes: Option<u64>,

    /// Logging configuration
    #[command(flatten)]
    pub log_args: LogArgs,
}

impl SandboxArgs {
    /// The resource limits requested on the command line or in the environment.
    pub const fn limits(&self) -> ResourceLimits {
        ResourceLimits { cpu_seconds: self.cpu_seconds, memory_bytes: self.memory_bytes }
    }
}
