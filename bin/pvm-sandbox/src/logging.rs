//! Logging configuration shared by the PVM binaries.
//!
//! Provides CLI arguments for configuring tracing output with support for:
//! - verbosity levels via `-v/-vv/-vvv` flags
//! - custom filters via the `RUST_LOG` environment variable
//! - log file output via the `--log.file` flag

use std::{fs::File, io, path::PathBuf};

use clap::Parser;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration arguments.
#[derive(Debug, Clone, Default, Parser)]
pub struct LogArgs {
    /// Increase logging verbosity (-v = error, -vv = warn, -vvv = info, -vvvv = debug, -vvvvv =
    /// trace)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log file path. If specified, logs are written to this file instead of stderr.
    #[arg(long = "log.file", visible_aliases = ["log-file"], global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colorful console logging. Only applies when logging to stderr (no --log.file).
    #[arg(long = "log.no-color", visible_aliases = ["log-no-color"], global = true)]
    pub log_no_color: bool,
}

impl LogArgs {
    /// The filter selected by `RUST_LOG` or, failing that, by the verbosity.
    pub fn filter(&self) -> EnvFilter {
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::from_default_env();
        }
        let level = match self.verbose {
            0 => return EnvFilter::new("off"),
            1 => Level::ERROR,
            2 => Level::WARN,
            3 => Level::INFO,
            4 => Level::DEBUG,
            _ => Level::TRACE,
        };
        EnvFilter::new(format!("pvm={level},pvme={level},pvm_sandbox={level}"))
    }

    /// Installs the global tracing subscriber.
    ///
    /// The level is taken from `RUST_LOG` if set, otherwise from the `-v` count; without either
    /// nothing is logged. Targets are shown from DEBUG up. Logs go to stderr unless a log file
    /// is given; standard output is never written to.
    pub fn init(&self) -> io::Result<()> {
        let filter = self.filter();
        let show_target = self.verbose >= 4;

        if let Some(ref log_file) = self.log_file {
            let file = File::create(log_file)?;
            fmt()
                .with_env_filter(filter)
                .with_target(show_target)
                .with_writer(file)
                .with_ansi(false)
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_target(show_target)
                .with_writer(io::stderr)
                .with_ansi(!self.log_no_color)
                .init();
        }
        Ok(())
    }
}
