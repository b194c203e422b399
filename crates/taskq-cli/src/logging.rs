//! Diagnostics for the demo runner.
//!
//! Queue events reach `tracing` through the core's `TracingLogSink`; this
//! module installs the subscriber that prints them to stderr, leaving stdout
//! for task outcomes. The verbosity comes from `--log-level`, then
//! `TASKQ_LOG`, then `info`.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "TASKQ_LOG";

pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env_level = std::env::var(LOG_ENV).ok();
    let max_level = resolve_level(cli_level, env_level.as_deref());

    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("installing the log subscriber")
}

/// Unparsable `TASKQ_LOG` values fall back to `info` rather than failing.
pub fn resolve_level(cli_level: Option<LogLevel>, env_level: Option<&str>) -> LevelFilter {
    if let Some(level) = cli_level {
        return level.into();
    }
    env_level
        .and_then(parse_env_level)
        .unwrap_or(LevelFilter::INFO)
}

/// Accepts `tracing`'s names (and `off`) plus the queue's own `warning`.
fn parse_env_level(raw: &str) -> Option<LevelFilter> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("warning") {
        return Some(LevelFilter::WARN);
    }
    raw.parse().ok()
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}
