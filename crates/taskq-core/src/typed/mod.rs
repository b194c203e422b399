//! Typed - 型付き Task API
//!
//! task_type の typo を型で排除し、Handler との対応付けを静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Payload` trait, `Handler<P>` trait - 型安全
//! - **内部（Dyn）**: `TaskHandler` (queue module) - object-safe, type erasure

pub mod handler;
pub mod payload;

pub use self::handler::{Handler, TypedHandler};
pub use self::payload::Payload;
