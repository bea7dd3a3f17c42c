//! Broker driver boundary
//!
//! The queue core never talks to a concrete broker SDK. Everything it needs
//! from the transport is expressed by the two traits in this module:
//!
//! - `BrokerDriver`: opens new sessions to the broker cluster
//! - `BrokerSession`: one physical session (subscribe, publish, ack, state)
//!
//! Two drivers ship with the crate:
//!
//! - `InMemoryBroker`: in-process broker with consumer groups, manual ack
//!   tracking and simulated disconnects (tests, local development)
//! - `RedisStreamsDriver`: Redis Streams with consumer groups

mod backoff;
mod factory;
mod memory;
mod redis_streams;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use uuid::Uuid;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use factory::create_driver;
pub use memory::InMemoryBroker;
pub use redis_streams::RedisStreamsDriver;

/// Errors reported by broker drivers
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The session is no longer connected to the broker
    #[error("Session disconnected")]
    Disconnected,

    /// The broker refused new sessions
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Unknown subscription id
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Unsupported driver kind in configuration
    #[error("Unsupported broker kind: {0}")]
    UnsupportedKind(String),
}

/// Connectivity state published by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Identifier of a broker-level subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Options for a broker-level subscription
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Consumer group; each message is delivered to one member of the group.
    /// `None` means every subscriber receives every message.
    pub group: Option<String>,
    /// When false the broker considers a message acknowledged on delivery
    pub manual_ack: bool,
    /// The subject lives only as long as this subscription; drivers may drop
    /// its storage on unsubscribe
    pub transient: bool,
}

impl SubscribeOptions {
    pub fn group(group: impl Into<String>, manual_ack: bool) -> Self {
        Self {
            group: Some(group.into()),
            manual_ack,
            transient: false,
        }
    }

    /// Ungrouped, auto-acknowledged subscription on a subject owned by the
    /// subscriber (reply subjects)
    pub fn ephemeral() -> Self {
        Self {
            group: None,
            manual_ack: false,
            transient: true,
        }
    }
}

/// A message handed to a subscription handler
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Consumer group the delivery belongs to
    pub group: Option<String>,
    /// Driver specific acknowledgment token
    pub token: String,
    /// Raw envelope bytes
    pub data: Bytes,
}

/// Delivery callback.
///
/// Drivers invoke it sequentially per subscription and await the returned
/// future before handing over the next delivery.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opens sessions to a broker cluster
#[async_trait]
pub trait BrokerDriver: Send + Sync + 'static {
    /// Human readable broker address, used as registry key and in logs
    fn address(&self) -> &str;

    /// Open a new physical session
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One physical session to the broker
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Whether the transport currently reports the session as connected
    fn is_connected(&self) -> bool;

    /// Reconnect/disconnect event stream
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Subscribe `handler` to `subject`
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, BrokerError>;

    /// Remove a subscription created by this session
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError>;

    /// Publish raw bytes on `subject`
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Acknowledge a delivery received through a manual-ack subscription
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Close the session and all of its subscriptions
    async fn disconnect(&self) -> Result<(), BrokerError>;
}
