//! Producer and request/reply
//!
//! - `Producer`: publish and request over a leased connector
//! - `ReplyRegistry`: correlation of replies by ephemeral reply subject

mod publisher;
mod reply;

pub use publisher::Producer;
pub use reply::{PendingReply, ReplyRegistry, ReplySubscription};
