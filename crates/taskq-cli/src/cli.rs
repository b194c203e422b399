//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `taskq-cli`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskq-cli",
    version,
    about = "Drive a persistent task queue with a chain of demo tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Queue config file (JSON). Defaults to a queue named `demo`.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the persisted queue state.
    #[arg(long, value_name = "DIR", default_value = ".taskq")]
    pub state_dir: PathBuf,

    /// Number of chained demo tasks to submit.
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub tasks: u32,

    /// How many attempts fail (across all tasks) before the handler succeeds.
    #[arg(long, value_name = "K", default_value_t = 2)]
    pub failures: u32,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKQ_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
