use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use pvm_executor::{
    pool::SandboxPoolConfiguration, ExecutionMode, Executor, ExecutorConfig, Gas,
    SandboxedConfig, VmExecutionResult,
};
use tracing::info;

use crate::common::{load_hex, LogArgs, PvmeError, Result, RunOutput};

/// Number of timed iterations of `--bench`.
const BENCH_ITERATIONS: u32 = 100;

/// How the program is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Interpret in this process
    #[default]
    Interpreter,
    /// Compile and run in this process
    Jit,
    /// Run in a fresh sandbox process
    Sandboxed,
    /// Run in a pool of warm sandbox processes
    Pooled,
}

impl Mode {
    /// The execution flags for this mode.
    pub fn execution_mode(self) -> ExecutionMode {
        match self {
            Self::Interpreter => ExecutionMode::empty(),
            Self::Jit => ExecutionMode::JIT,
            Self::Sandboxed | Self::Pooled => ExecutionMode::SANDBOXED,
        }
    }
}

/// Run a program blob
#[derive(Parser, Debug)]
pub struct Cmd {
    /// Program blob as hex string (positional argument)
    #[arg(value_name = "BLOB")]
    pub blob: Option<String>,

    /// File containing the program blob as hex. If '-' is specified, it is read from stdin
    #[arg(long = "file")]
    pub file: Option<String>,

    /// Initial program counter
    #[arg(long = "pc", default_value = "0")]
    pub pc: u32,

    /// Gas limit for the run
    #[arg(long = "gas", default_value = "10000000")]
    pub gas: u64,

    /// Argument data for the program (hex string)
    #[arg(long = "input")]
    pub input: Option<String>,

    /// Execution strategy
    #[arg(long = "mode", value_enum, default_value_t = Mode::Interpreter)]
    pub mode: Mode,

    /// Sandbox executable, overriding the usual lookup
    #[arg(long = "sandbox-path")]
    pub sandbox_path: Option<PathBuf>,

    /// Print the result as JSON on stdout
    #[arg(long = "json")]
    pub json: bool,

    /// Benchmark the execution
    #[arg(long = "bench")]
    pub bench: bool,

    /// Logging configuration
    #[command(flatten)]
    pub log_args: LogArgs,
}

impl Cmd {
    /// Execute the run command
    pub async fn run(&self) -> Result<()> {
        self.log_args.init().map_err(PvmeError::Logging)?;

        let blob = load_hex(self.blob.clone(), self.file.clone())?
            .ok_or_else(|| PvmeError::InvalidInput("no program blob given".to_string()))?;
        let input = load_hex(self.input.clone(), None)?;

        let executor = self.executor();
        info!(target: "pvme", kind = %executor.kind(), len = blob.len(), "running program");

        let outcome = if self.bench {
            self.execute_benchmark(&executor, &blob, input.as_deref()).await
        } else {
            self.execute_once(&executor, &blob, input.as_deref()).await
        };
        executor.shutdown().await;
        let (result, elapsed) = outcome?;

        self.output_results(&RunOutput::new(executor.kind(), &result, elapsed))
    }

    /// Wires the executor selected by the arguments.
    pub fn executor(&self) -> Executor {
        let mode = self.mode.execution_mode();
        let sandbox =
            SandboxedConfig { executable: self.sandbox_path.clone(), ..Default::default() };
        let pool = (self.mode == Mode::Pooled).then(|| SandboxPoolConfiguration {
            sandbox_path: self.sandbox_path.clone(),
            ..SandboxPoolConfiguration::development()
        });
        Executor::with_config(ExecutorConfig { mode, sandbox, pool })
    }

    async fn execute_once(
        &self,
        executor: &Executor,
        blob: &[u8],
        input: Option<&[u8]>,
    ) -> Result<(VmExecutionResult, Duration)> {
        let start = Instant::now();
        let result = executor.execute(blob, self.pc, Gas::new(self.gas), input, None).await?;
        Ok((result, start.elapsed()))
    }

    async fn execute_benchmark(
        &self,
        executor: &Executor,
        blob: &[u8],
        input: Option<&[u8]>,
    ) -> Result<(VmExecutionResult, Duration)> {
        // Warm-up run, which also starts any pool
        let (result, _) = self.execute_once(executor, blob, input).await?;

        let mut total = Duration::ZERO;
        for _ in 0..BENCH_ITERATIONS {
            let (_, elapsed) = self.execute_once(executor, blob, input).await?;
            total += elapsed;
        }
        Ok((result, total / BENCH_ITERATIONS))
    }

    fn output_results(&self, output: &RunOutput) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(output)?);
            return Ok(());
        }

        if let Some(ref data) = output.output {
            println!("{data}");
        }
        eprintln!("executor:   {}", output.executor);
        eprintln!("exit:       {} (code {:#x})", output.exit_reason, output.exit_code);
        eprintln!("gas used:   {}", output.gas_used);
        eprintln!("final pc:   {}", output.final_pc);
        eprintln!("registers:  {:?}", output.registers);
        let label = if self.bench { "avg time:" } else { "time:" };
        eprintln!("{label:<11} {}us", output.elapsed_micros);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pvm_executor::ExecutorKind;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::interpreter("interpreter", ExecutorKind::InProcessInterpreter)]
    #[case::jit("jit", ExecutorKind::InProcessJit)]
    #[case::sandboxed("sandboxed", ExecutorKind::Sandboxed)]
    #[case::pooled("pooled", ExecutorKind::PooledSandboxed)]
    fn test_mode_selects_executor(#[case] mode: &str, #[case] kind: ExecutorKind) {
        let cmd = Cmd::try_parse_from(["run", "00", "--mode", mode]).unwrap();
        assert_eq!(cmd.executor().kind(), kind);
    }

    #[test]
    fn test_defaults() {
        let cmd = Cmd::try_parse_from(["run"]).unwrap();
        assert_eq!(cmd.gas, 10_000_000);
        assert_eq!(cmd.pc, 0);
        assert_eq!(cmd.mode, Mode::Interpreter);
        assert!(cmd.blob.is_none());
    }
}
