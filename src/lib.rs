// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules at the crate root
pub use infrastructure::broker;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Domain layer (queue core)
pub mod domain;

pub use domain::connection;
pub use domain::consumer;
pub use domain::message;
pub use domain::producer;

// Application layer
pub mod api;
pub mod client;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod telemetry;

pub use client::{PersistentQueue, QueueRegistry};
pub use error::{QueueError, Result};
pub use message::{Envelope, Message, MessageContext};
