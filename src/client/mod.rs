//! Client facade
//!
//! - `PersistentQueue`: one pool per broker, producer cache, consumers
//! - `QueueRegistry`: queues keyed by broker address

mod queue;
mod registry;

pub use queue::PersistentQueue;
pub use registry::QueueRegistry;
