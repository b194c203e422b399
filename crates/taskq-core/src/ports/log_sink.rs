//! LogSink port - leveled logging called by the queue and its tasks.
//!
//! Sinks are fire-and-forget: they must not block for long and are called
//! from worker threads concurrently.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
        };
        f.write_str(s)
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}
