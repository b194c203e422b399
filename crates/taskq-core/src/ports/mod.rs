//! Ports - the collaborators the queue calls into.
//!
//! Each trait hides an external concern (storage, logging, time, IDs) so the
//! scheduler can be tested with in-memory implementations.

pub mod clock;
pub mod id_generator;
pub mod log_sink;
pub mod persistence;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::log_sink::{LogLevel, LogSink};
pub use self::persistence::{PersistenceError, PersistenceProvider};
