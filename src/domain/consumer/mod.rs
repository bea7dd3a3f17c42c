//! Consumer pipeline
//!
//! Deliveries are deduplicated against the in-flight set, written to a
//! bounded buffer and drained by parallel workers that invoke the
//! application callback and acknowledge on success.

mod options;
mod pipeline;
mod processing;

pub use options::ConsumerOptions;
pub use pipeline::{Consumer, ConsumerState};
pub use processing::{InFlight, ProcessingQueue};
