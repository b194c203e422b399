//! LogSink implementations backed by `tracing`.

use crate::ports::{LogLevel, LogSink};

/// Forwards queue log lines to `tracing`, tagged with the queue name.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    queue: String,
}

impl TracingLogSink {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        let queue = self.queue.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(queue, "{message}"),
            LogLevel::Debug => tracing::debug!(queue, "{message}"),
            LogLevel::Info => tracing::info!(queue, "{message}"),
            LogLevel::Warning => tracing::warn!(queue, "{message}"),
            LogLevel::Error => tracing::error!(queue, "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}
