//! TaskRecord - the persisted shape of a task.
//!
//! Field names and timestamp format are the wire contract shared with stored
//! data, so they are spelled out explicitly instead of derived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QueuePriority, ServiceClass, TaskId, TaskType};

/// Serialized task record.
///
/// ```json
/// {"taskID":"a","taskType":"upload","dependencies":[],"queuePriority":0,
///  "serviceClass":-1,"data":{},"created":"2024-01-01T12:00:00.000Z",
///  "started":null,"retries":0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "taskID")]
    pub task_id: TaskId,

    #[serde(rename = "taskType")]
    pub task_type: TaskType,

    pub dependencies: Vec<TaskId>,

    #[serde(rename = "queuePriority")]
    pub queue_priority: QueuePriority,

    #[serde(rename = "serviceClass")]
    pub service_class: ServiceClass,

    pub data: serde_json::Value,

    #[serde(with = "iso_millis")]
    pub created: DateTime<Utc>,

    #[serde(default, with = "iso_millis::option")]
    pub started: Option<DateTime<Utc>>,

    pub retries: u32,
}

impl TaskRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Truncate to whole milliseconds, the resolution kept on disk.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// ISO-8601 UTC with millisecond precision (`2024-01-01T12:00:00.000Z`).
pub mod iso_millis {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn format(at: &DateTime<Utc>) -> String {
        at.format(FORMAT).to_string()
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(raw, FORMAT).map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_some(&format(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
