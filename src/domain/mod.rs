//! Domain layer modules
//!
//! This module contains the queue core:
//! - `connection`: Pooled broker connections and reconnect-following connectors
//! - `consumer`: Buffered, deduplicating consumer pipeline
//! - `message`: Envelope wire format and message context
//! - `producer`: Publishing and request/reply

pub mod connection;
pub mod consumer;
pub mod message;
pub mod producer;
