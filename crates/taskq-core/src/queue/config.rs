//! Queue configuration.

use serde::{Deserialize, Serialize};

use super::RetryPolicy;
use crate::error::QueueError;

pub const DEFAULT_MAX_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Static configuration of one queue.
///
/// ```json
/// {"name": "uploads", "max_concurrency": 3, "max_retries": 5,
///  "retry": {"min_delay_ms": 200, "max_delay_ms": 60000}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue identity; also the persistence namespace.
    pub name: String,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Failed attempts allowed before a task is cancelled.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| QueueError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue name must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(QueueError::InvalidConfig(format!(
                "retry.min_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.min_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}
