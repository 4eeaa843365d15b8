//! Default implementations of the engine's pluggable traits.
//!
//! Enough to start an engine with no external services. Each can be
//! replaced through [`EngineBuilder`](crate::EngineBuilder).

pub mod file_queue;
pub mod file_store;
pub mod in_memory_queue;
pub mod in_memory_store;
pub mod log_notifier;

pub use file_queue::FileQueue;
pub use file_store::FileStore;
pub use in_memory_queue::InMemoryQueue;
pub use in_memory_store::InMemoryStore;
pub use log_notifier::LogNotifier;
