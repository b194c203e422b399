//! Payload trait - 型付き payload と task_type の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::queue::{Task, TaskBuilder};

/// Payload は task_type と型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     path: String,
///     width: u32,
/// }
///
/// impl Payload for Resize {
///     const TYPE: &'static str = "media.resize.v1";
/// }
///
/// let task = TaskBuilder::typed(&Resize { path: "a.png".into(), width: 64 })?.build();
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義。`{namespace}.{action}.v{major}` を推奨
    const TYPE: &'static str;
}

impl TaskBuilder {
    /// Builder for a task of type `P::TYPE` carrying `payload`.
    pub fn typed<P: Payload>(payload: &P) -> Result<TaskBuilder, serde_json::Error> {
        Ok(TaskBuilder::new(P::TYPE).payload(serde_json::to_value(payload)?))
    }
}

impl Task {
    /// Decode the payload as `P`.
    pub fn decode<P: Payload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload().clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::Payload;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Resize {
        pub path: String,
        pub width: u32,
    }

    impl Payload for Resize {
        const TYPE: &'static str = "media.resize.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Tag {
        pub name: String,
        pub labels: HashMap<String, String>,
    }

    impl Payload for Tag {
        const TYPE: &'static str = "media.tag.v1";
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{Resize, Tag};
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_builder_sets_type_and_payload() {
        let task = TaskBuilder::typed(&Resize {
            path: "a.png".into(),
            width: 64,
        })
        .unwrap()
        .id("r1")
        .build();

        assert_eq!(task.task_type().as_str(), Resize::TYPE);
        assert_eq!(task.payload(), &json!({"path": "a.png", "width": 64}));
        assert_eq!(task.decode::<Resize>().unwrap().width, 64);
    }

    #[test]
    fn decode_as_wrong_type_fails() {
        let task = Task::builder(Resize::TYPE)
            .payload(json!({"path": "a.png", "width": 64}))
            .build();
        assert!(task.decode::<Tag>().is_err());
    }
}
