//! Message model
//!
//! - `Message`: application payload types with a stable type tag
//! - `Envelope`: the JSON wire unit (`id`, `replyTo`, typed payload)
//! - `MessageContext`: causation chain carried by every envelope

mod context;
mod envelope;

pub use context::MessageContext;
pub use envelope::{Envelope, EnvelopeHeader, Payload};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload type that can travel through the queue.
///
/// The type tag selects the subject the message is published on and is
/// checked on receipt.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> &'static str;
}
