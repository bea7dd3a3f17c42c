//! Request/reply correlation

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::broker::{Delivery, DeliveryHandler, SubscriptionId};
use crate::connection::Connector;

/// Outstanding requests keyed by their ephemeral reply subject
#[derive(Debug, Clone, Default)]
pub struct ReplyRegistry {
    pending: Arc<DashMap<String, oneshot::Sender<Bytes>>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subject`; the entry lives until the returned guard drops
    pub fn register(&self, subject: String) -> (PendingReply, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(subject.clone(), tx);
        (
            PendingReply {
                subject,
                pending: self.pending.clone(),
            },
            rx,
        )
    }

    /// Hand a reply to the request waiting on `subject`.
    ///
    /// Returns false for unknown subjects and for repeated replies.
    pub fn complete(&self, subject: &str, data: Bytes) -> bool {
        match self.pending.remove(subject) {
            Some((_, tx)) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Delivery handler completing requests from the reply subscription
    pub fn handler(&self) -> DeliveryHandler {
        let registry = self.clone();
        Arc::new(move |delivery: Delivery| {
            let registry = registry.clone();
            async move {
                if !registry.complete(&delivery.subject, delivery.data) {
                    tracing::debug!(reply_to = %delivery.subject, "Reply without waiting request dropped");
                }
            }
            .boxed()
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Removes the registry entry on drop
#[derive(Debug)]
pub struct PendingReply {
    subject: String,
    pending: Arc<DashMap<String, oneshot::Sender<Bytes>>>,
}

impl PendingReply {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending.remove(&self.subject);
    }
}

/// Broker subscription on a reply subject.
///
/// `close` unsubscribes; a guard dropped without `close` (cancelled request)
/// unsubscribes in the background.
pub struct ReplySubscription {
    connector: Arc<Connector>,
    id: Option<SubscriptionId>,
}

impl ReplySubscription {
    pub fn new(connector: Arc<Connector>, id: SubscriptionId) -> Self {
        Self {
            connector,
            id: Some(id),
        }
    }

    pub async fn close(mut self) {
        if let Some(id) = self.id.take() {
            unsubscribe(&self.connector, id).await;
        }
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connector = self.connector.clone();
            runtime.spawn(async move { unsubscribe(&connector, id).await });
        }
    }
}

async fn unsubscribe(connector: &Connector, id: SubscriptionId) {
    if let Err(e) = connector.unsubscribe(id).await {
        // The session may have been replaced; its subscriptions died with it
        tracing::debug!(error = %e, subscription_id = %id, "Failed to remove reply subscription");
    }
}
