//! Domain model (IDs, task types, lifecycle, errors, persisted record).

pub mod errors;
pub mod ids;
pub mod priority;
pub mod record;
pub mod state;
pub mod task_type;

pub use self::errors::TaskError;
pub use self::ids::TaskId;
pub use self::priority::{QueuePriority, ServiceClass};
pub use self::record::TaskRecord;
pub use self::state::TaskState;
pub use self::task_type::TaskType;
