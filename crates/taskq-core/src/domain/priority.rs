//! Scheduling hints forwarded to the worker pool.
//!
//! Both are persisted as plain integers.

use serde::{Deserialize, Serialize};

/// Relative priority among ready tasks. Higher runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum QueuePriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl From<QueuePriority> for i32 {
    fn from(value: QueuePriority) -> Self {
        match value {
            QueuePriority::VeryLow => -8,
            QueuePriority::Low => -4,
            QueuePriority::Normal => 0,
            QueuePriority::High => 4,
            QueuePriority::VeryHigh => 8,
        }
    }
}

impl TryFrom<i32> for QueuePriority {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -8 => Ok(QueuePriority::VeryLow),
            -4 => Ok(QueuePriority::Low),
            0 => Ok(QueuePriority::Normal),
            4 => Ok(QueuePriority::High),
            8 => Ok(QueuePriority::VeryHigh),
            other => Err(format!("unknown queue priority {other}")),
        }
    }
}

/// Quality-of-service class. Breaks ties between equal priorities.
///
/// Wire values are the platform QoS raw values (`Default` is -1), so they do
/// not sort in urgency order; comparisons use declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ServiceClass {
    Background,
    Utility,
    #[default]
    Default,
    UserInitiated,
    UserInteractive,
}

impl From<ServiceClass> for i32 {
    fn from(value: ServiceClass) -> Self {
        match value {
            ServiceClass::Background => 9,
            ServiceClass::Utility => 17,
            ServiceClass::Default => -1,
            ServiceClass::UserInitiated => 25,
            ServiceClass::UserInteractive => 33,
        }
    }
}

impl TryFrom<i32> for ServiceClass {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            9 => Ok(ServiceClass::Background),
            17 => Ok(ServiceClass::Utility),
            -1 => Ok(ServiceClass::Default),
            25 => Ok(ServiceClass::UserInitiated),
            33 => Ok(ServiceClass::UserInteractive),
            other => Err(format!("unknown service class {other}")),
        }
    }
}
