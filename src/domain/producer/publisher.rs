use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::SubscribeOptions;
use crate::connection::{ConnectionPool, Connector};
use crate::error::QueueError;
use crate::message::{Envelope, Message, MessageContext};
use crate::metrics::{names, MetricsCollector, TAG_MESSAGE_TYPE};

use super::{ReplyRegistry, ReplySubscription};

/// Publishes messages of type `M` and performs request/reply
pub struct Producer<M: Message> {
    connector: Arc<Connector>,
    subject: String,
    reply_subject_prefix: String,
    metrics: Arc<dyn MetricsCollector>,
    replies: ReplyRegistry,
    _message: PhantomData<fn(M)>,
}

impl<M: Message> Producer<M> {
    pub async fn new(pool: Arc<ConnectionPool>) -> Result<Self, QueueError> {
        let message_type = M::message_type();
        let subject = pool.options().subject_for(message_type);
        let reply_subject_prefix = pool.options().reply_subject_prefix.clone();
        let metrics = pool.metrics().clone();
        let connector = Connector::lease(pool, message_type).await?;

        Ok(Self {
            connector,
            subject,
            reply_subject_prefix,
            metrics,
            replies: ReplyRegistry::new(),
            _message: PhantomData,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.replies.len()
    }

    /// Publish `message`, attaching `context` or a fresh one.
    ///
    /// Returns the envelope id. Transport failures are returned, never dropped.
    pub async fn publish(
        &self,
        message: &M,
        context: Option<MessageContext>,
    ) -> Result<Uuid, QueueError> {
        let envelope = Envelope::new(message, context.unwrap_or_default(), None)?;
        self.send(&envelope).await?;
        Ok(envelope.id())
    }

    /// Publish `message` and wait up to `timeout` for a reply of type `R`
    pub async fn request<R: Message>(
        &self,
        message: &M,
        timeout: Duration,
    ) -> Result<R, QueueError> {
        self.request_with_context(message, None, timeout).await
    }

    /// Like `request`, with an explicit context for the outgoing envelope.
    ///
    /// The reply subject is unique per call and doubles as correlation key.
    /// Its subscription and registry entry are removed whether the request
    /// succeeds, fails or times out.
    pub async fn request_with_context<R: Message>(
        &self,
        message: &M,
        context: Option<MessageContext>,
        timeout: Duration,
    ) -> Result<R, QueueError> {
        let reply_to = format!("{}.{}", self.reply_subject_prefix, Uuid::new_v4());
        let (pending, rx) = self.replies.register(reply_to.clone());

        let subscription_id = self
            .connector
            .subscribe(&reply_to, SubscribeOptions::ephemeral(), self.replies.handler())
            .await?;
        let subscription = ReplySubscription::new(self.connector.clone(), subscription_id);

        let outcome = self
            .exchange(message, context, &reply_to, rx, timeout)
            .await;

        subscription.close().await;
        drop(pending);

        let envelope = Envelope::from_bytes(&outcome?)?;
        let response = envelope.decode_body::<R>().map_err(|e| {
            tracing::warn!(
                error = %e,
                reply_to = %reply_to,
                "Unexpected reply type"
            );
            e
        })?;

        tracing::debug!(
            envelope_id = %envelope.id(),
            message_type = %R::message_type(),
            "Reply received"
        );
        Ok(response)
    }

    async fn exchange(
        &self,
        message: &M,
        context: Option<MessageContext>,
        reply_to: &str,
        rx: oneshot::Receiver<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, QueueError> {
        let envelope = Envelope::new(
            message,
            context.unwrap_or_default(),
            Some(reply_to.to_string()),
        )?;
        self.send(&envelope).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(QueueError::ConnectionLost(format!(
                "reply channel {reply_to} closed"
            ))),
            Err(_) => {
                tracing::warn!(
                    envelope_id = %envelope.id(),
                    message_type = %M::message_type(),
                    reply_to = %reply_to,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                self.metrics.meter(
                    names::REQUEST_TIMEOUTS,
                    1.0,
                    &[(TAG_MESSAGE_TYPE, M::message_type())],
                    Some(envelope.context()),
                );
                Err(QueueError::RequestTimeout(timeout))
            }
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), QueueError> {
        if let Err(e) = self
            .connector
            .publish(&self.subject, envelope.to_bytes()?)
            .await
        {
            tracing::error!(
                error = %e,
                envelope_id = %envelope.id(),
                message_type = %M::message_type(),
                "Failed to publish envelope"
            );
            return Err(e);
        }

        self.metrics.meter(
            names::MESSAGES_SENT,
            1.0,
            &[(TAG_MESSAGE_TYPE, M::message_type())],
            Some(envelope.context()),
        );
        tracing::debug!(
            envelope_id = %envelope.id(),
            subject = %self.subject,
            "Envelope published"
        );
        Ok(())
    }

    /// Release the connector back to the pool
    pub fn dispose(&self) {
        self.connector.dispose();
    }
}
