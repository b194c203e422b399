//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryStore**: プロセス内の PersistenceProvider（テスト・開発用）
//! - **JsonFileStore**: キューごとに JSON ファイル 1 つ
//! - **TracingLogSink** / **NoopLogSink**: LogSink

pub mod file_store;
pub mod memory_store;
pub mod tracing_log;

pub use self::file_store::JsonFileStore;
pub use self::memory_store::MemoryStore;
pub use self::tracing_log::{NoopLogSink, TracingLogSink};
