//! Buffered consumer pipeline.
//!
//! ```text
//! broker delivery ─▶ peek id ─▶ dedup ─▶ try_send ─▶ [buffer] ─▶ N workers ─▶ callback ─▶ ack
//! ```

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryHandler, SubscribeOptions, SubscriptionId};
use crate::connection::{Connection, ConnectionPool, Connector, ListenerId, ReconnectListener};
use crate::error::QueueError;
use crate::message::{Envelope, Message, MessageContext};
use crate::metrics::{names, MetricsCollector, TAG_MESSAGE_TYPE};

use super::{ConsumerOptions, InFlight, ProcessingQueue};

/// Lifecycle of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Created = 0,
    Subscribed = 1,
    Running = 2,
    Unsubscribing = 3,
    Stopped = 4,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Created,
            1 => ConsumerState::Subscribed,
            2 => ConsumerState::Running,
            3 => ConsumerState::Unsubscribing,
            _ => ConsumerState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Created => "created",
            ConsumerState::Subscribed => "subscribed",
            ConsumerState::Running => "running",
            ConsumerState::Unsubscribing => "unsubscribing",
            ConsumerState::Stopped => "stopped",
        }
    }
}

/// A buffered delivery together with its in-flight guard
struct Inbound {
    delivery: Delivery,
    _in_flight: InFlight,
}

struct ConsumerInner {
    connector: Arc<Connector>,
    subject: String,
    group: String,
    message_type: &'static str,
    options: ConsumerOptions,
    metrics: Arc<dyn MetricsCollector>,
    state: AtomicU8,
    processing: ProcessingQueue,
    /// Sender side of the buffer; `None` once the buffer is complete
    gate: RwLock<Option<mpsc::Sender<Inbound>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    subscription: tokio::sync::Mutex<Option<SubscriptionId>>,
    handler: Mutex<Option<DeliveryHandler>>,
    reconnect_listener: Mutex<Option<ListenerId>>,
    shutdown: tokio::sync::Mutex<()>,
}

/// Consumes messages of type `M` from the pool's consumer group
pub struct Consumer<M: Message> {
    inner: Arc<ConsumerInner>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> Consumer<M> {
    /// Lease a connector for `M` and prepare the consumer
    pub async fn new(
        pool: Arc<ConnectionPool>,
        options: ConsumerOptions,
    ) -> Result<Self, QueueError> {
        options.validate()?;

        let message_type = M::message_type();
        let subject = pool.options().subject_for(message_type);
        let group = options
            .group
            .clone()
            .unwrap_or_else(|| pool.options().consumer_group_name.clone());
        let metrics = pool.metrics().clone();
        let connector = Connector::lease(pool, message_type).await?;

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                connector,
                subject,
                group,
                message_type,
                options,
                metrics,
                state: AtomicU8::new(ConsumerState::Created as u8),
                processing: ProcessingQueue::new(),
                gate: RwLock::new(None),
                workers: tokio::sync::Mutex::new(Vec::new()),
                subscription: tokio::sync::Mutex::new(None),
                handler: Mutex::new(None),
                reconnect_listener: Mutex::new(None),
                shutdown: tokio::sync::Mutex::new(()),
            }),
            _message: PhantomData,
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state()
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.inner.connector
    }

    /// Envelope ids currently buffered or being processed
    pub fn in_flight(&self) -> usize {
        self.inner.processing.len()
    }

    /// Subscribe and start the worker loops.
    ///
    /// Callback errors and panics count as failures: they are logged and
    /// the envelope is left unacknowledged for broker redelivery.
    pub async fn run<F, Fut>(&self, callback: F) -> Result<(), QueueError>
    where
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.begin()?;

        let (tx, rx) = mpsc::channel::<Inbound>(inner.options.buffer_size);
        *inner.gate.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let callback = Arc::new(callback);
        {
            let mut workers = inner.workers.lock().await;
            for worker in 0..inner.options.workers {
                let inner = inner.clone();
                let rx = rx.clone();
                let callback = callback.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(inbound) = next else { break };
                        inner.dispatch::<M, _, _>(inbound, callback.as_ref()).await;
                    }
                    tracing::debug!(
                        worker,
                        message_type = %inner.message_type,
                        "Consumer worker stopped"
                    );
                }));
            }
        }

        let weak = Arc::downgrade(inner);
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.accept(delivery);
                }
            }
            .boxed()
        });

        if let Err(e) = inner.start(handler).await {
            inner.gate.write().unwrap_or_else(PoisonError::into_inner).take();
            for worker in std::mem::take(&mut *inner.workers.lock().await) {
                let _ = worker.await;
            }
            inner.set_state(ConsumerState::Created);
            return Err(e);
        }

        tracing::info!(
            subject = %inner.subject,
            group = %inner.group,
            workers = inner.options.workers,
            buffer_size = inner.options.buffer_size,
            "Consumer running"
        );
        Ok(())
    }

    /// Serve requests inline, publishing responses to each envelope's reply subject.
    ///
    /// The callback returns `(success, response)`. The envelope is
    /// acknowledged only when `success` is true; a response is published
    /// whenever one is returned and the request carried a reply subject.
    pub async fn run_with_response<R, F, Fut>(&self, callback: F) -> Result<(), QueueError>
    where
        R: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (bool, Option<R>)> + Send + 'static,
    {
        let inner = &self.inner;
        inner.begin()?;

        let weak = Arc::downgrade(inner);
        let callback = Arc::new(callback);
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let weak = weak.clone();
            let callback = callback.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.respond::<M, R, _, _>(delivery, callback.as_ref()).await;
                }
            }
            .boxed()
        });

        if let Err(e) = inner.start(handler).await {
            inner.set_state(ConsumerState::Created);
            return Err(e);
        }

        tracing::info!(
            subject = %inner.subject,
            group = %inner.group,
            response_type = %R::message_type(),
            "Responder running"
        );
        Ok(())
    }

    /// Unsubscribe, drain every buffered envelope, then release the connector.
    ///
    /// Safe to call more than once; later calls wait for the first to finish.
    pub async fn dispose(&self) {
        self.inner.shutdown().await;
    }
}

impl<M: Message> Drop for Consumer<M> {
    fn drop(&mut self) {
        if self.inner.state() == ConsumerState::Stopped {
            return;
        }
        // Best effort when the owner forgot to dispose
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move { inner.shutdown().await });
        }
    }
}

impl ConsumerInner {
    fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn tags(&self) -> [(&'static str, &str); 1] {
        [(TAG_MESSAGE_TYPE, self.message_type)]
    }

    /// Created -> Subscribed, or fail if the consumer was started before
    fn begin(&self) -> Result<(), QueueError> {
        self.state
            .compare_exchange(
                ConsumerState::Created as u8,
                ConsumerState::Subscribed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| {
                QueueError::InvalidState(format!(
                    "consumer for {} is {}",
                    self.message_type,
                    ConsumerState::from_u8(current).as_str()
                ))
            })
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::group(self.group.clone(), self.options.manual_ack)
    }

    /// Subscribe `handler` and follow connector rebinds
    async fn start(self: &Arc<Self>, handler: DeliveryHandler) -> Result<(), QueueError> {
        {
            let mut subscription = self.subscription.lock().await;
            let id = self
                .connector
                .subscribe(&self.subject, self.subscribe_options(), handler.clone())
                .await?;
            *subscription = Some(id);
        }
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);

        let weak: Weak<ConsumerInner> = Arc::downgrade(self);
        let listener: ReconnectListener = Arc::new(move |connection: &Arc<Connection>| {
            let Some(inner) = weak.upgrade() else { return };
            let connection_id = connection.id();
            tokio::spawn(async move { inner.resubscribe(connection_id).await });
        });
        let listener_id = self.connector.on_reconnect(listener);
        *self
            .reconnect_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener_id);

        self.set_state(ConsumerState::Running);
        Ok(())
    }

    /// Re-issue the subscription on the connector's new connection
    async fn resubscribe(&self, connection_id: Uuid) {
        let mut subscription = self.subscription.lock().await;
        if self.state() != ConsumerState::Running {
            return;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else { return };

        match self
            .connector
            .subscribe(&self.subject, self.subscribe_options(), handler)
            .await
        {
            Ok(id) => {
                *subscription = Some(id);
                tracing::info!(
                    subject = %self.subject,
                    group = %self.group,
                    connection_id = %connection_id,
                    "Consumer resubscribed"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    subject = %self.subject,
                    connection_id = %connection_id,
                    "Failed to resubscribe consumer"
                );
            }
        }
    }

    /// Inbound handler: dedup, then buffer without blocking
    fn accept(&self, delivery: Delivery) {
        let header = match Envelope::peek(&delivery.data) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    subject = %delivery.subject,
                    "Dropping malformed envelope"
                );
                self.metrics
                    .meter(names::PROCESSING_FAILURES, 1.0, &self.tags(), None);
                return;
            }
        };

        let Some(in_flight) = self.processing.try_begin(header.id) else {
            tracing::debug!(
                envelope_id = %header.id,
                message_type = %self.message_type,
                "Duplicate delivery dropped"
            );
            self.metrics
                .meter(names::DUPLICATES, 1.0, &self.tags(), None);
            return;
        };

        let gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = gate.as_ref() else {
            tracing::debug!(
                envelope_id = %header.id,
                "Consumer stopping, delivery left for redelivery"
            );
            return;
        };

        match tx.try_send(Inbound {
            delivery,
            _in_flight: in_flight,
        }) {
            Ok(()) => {
                tracing::trace!(envelope_id = %header.id, "Envelope buffered");
                self.metrics
                    .meter(names::MESSAGES_RECEIVED, 1.0, &self.tags(), None);
            }
            Err(TrySendError::Full(_)) => {
                let err = QueueError::BufferOverflow(format!(
                    "consumer buffer of {} full ({} slots)",
                    self.message_type, self.options.buffer_size
                ));
                tracing::error!(
                    error = %err,
                    envelope_id = %header.id,
                    message_type = %self.message_type,
                    "Envelope rejected, left for redelivery"
                );
                self.metrics
                    .meter(names::BUFFER_OVERFLOWS, 1.0, &self.tags(), None);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(envelope_id = %header.id, "Buffer closed, delivery dropped");
            }
        }
    }

    /// Worker side: decode, run the callback, ack on success
    async fn dispatch<M, F, Fut>(&self, inbound: Inbound, callback: &F)
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let Inbound {
            delivery,
            _in_flight,
        } = inbound;

        let Some((envelope, message)) = self.decode::<M>(&delivery) else {
            return;
        };
        let context = envelope.context().clone();
        tracing::trace!(envelope_id = %envelope.id(), "Envelope dispatching");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async { callback(message, context.clone()).await })
            .catch_unwind()
            .await;
        self.metrics.histogram(
            names::PROCESSING_LATENCY,
            started.elapsed().as_secs_f64(),
            &self.tags(),
            Some(&context),
        );

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match result {
            Ok(()) => self.acknowledge(&delivery, &envelope).await,
            Err(reason) => self.failed(&envelope, reason),
        }
    }

    /// Inline request handling for `run_with_response`
    async fn respond<M, R, F, Fut>(&self, delivery: Delivery, callback: &F)
    where
        M: Message,
        R: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync,
        Fut: Future<Output = (bool, Option<R>)> + Send,
    {
        if self.state() != ConsumerState::Running {
            return;
        }

        let Some((envelope, message)) = self.decode::<M>(&delivery) else {
            return;
        };
        let Some(_in_flight) = self.processing.try_begin(envelope.id()) else {
            tracing::debug!(
                envelope_id = %envelope.id(),
                message_type = %self.message_type,
                "Duplicate request dropped"
            );
            self.metrics
                .meter(names::DUPLICATES, 1.0, &self.tags(), None);
            return;
        };
        self.metrics
            .meter(names::MESSAGES_RECEIVED, 1.0, &self.tags(), None);
        let context = envelope.context().clone();

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async { callback(message, context.clone()).await })
            .catch_unwind()
            .await;
        self.metrics.histogram(
            names::PROCESSING_LATENCY,
            started.elapsed().as_secs_f64(),
            &self.tags(),
            Some(&context),
        );

        let (success, response) = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.failed(&envelope, panic_message(panic.as_ref()));
                return;
            }
        };

        if let (Some(reply_to), Some(response)) = (envelope.reply_to(), response) {
            if let Err(e) = self.reply(reply_to, &response, &context).await {
                tracing::error!(
                    error = %e,
                    envelope_id = %envelope.id(),
                    reply_to = %reply_to,
                    "Failed to publish response"
                );
            }
        }

        if success {
            self.acknowledge(&delivery, &envelope).await;
        } else {
            self.failed(&envelope, "handler reported failure".to_string());
        }
    }

    async fn reply<R: Message>(
        &self,
        reply_to: &str,
        response: &R,
        request_context: &MessageContext,
    ) -> Result<(), QueueError> {
        let envelope = Envelope::new(response, request_context.child(), None)?;
        self.connector.publish(reply_to, envelope.to_bytes()?).await?;
        self.metrics.meter(
            names::MESSAGES_SENT,
            1.0,
            &[(TAG_MESSAGE_TYPE, R::message_type())],
            Some(envelope.context()),
        );
        tracing::debug!(
            envelope_id = %envelope.id(),
            reply_to = %reply_to,
            "Response published"
        );
        Ok(())
    }

    fn decode<M: Message>(&self, delivery: &Delivery) -> Option<(Envelope, M)> {
        let decoded = Envelope::from_bytes(&delivery.data)
            .and_then(|envelope| envelope.decode_body::<M>().map(|message| (envelope, message)));
        match decoded {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    subject = %delivery.subject,
                    message_type = %self.message_type,
                    "Failed to decode envelope"
                );
                self.metrics
                    .meter(names::PROCESSING_FAILURES, 1.0, &self.tags(), None);
                None
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery, envelope: &Envelope) {
        if self.options.manual_ack {
            if let Err(e) = self.connector.ack(delivery).await {
                tracing::warn!(
                    error = %e,
                    envelope_id = %envelope.id(),
                    message_type = %self.message_type,
                    "Failed to acknowledge envelope"
                );
                return;
            }
        }
        tracing::debug!(
            envelope_id = %envelope.id(),
            message_type = %self.message_type,
            "Envelope acked"
        );
    }

    fn failed(&self, envelope: &Envelope, reason: String) {
        let err = QueueError::Processing(reason);
        tracing::error!(
            error = %err,
            envelope_id = %envelope.id(),
            message_type = %envelope.message_type(),
            "Envelope processing failed, not acknowledged"
        );
        self.metrics.meter(
            names::PROCESSING_FAILURES,
            1.0,
            &self.tags(),
            Some(envelope.context()),
        );
    }

    async fn shutdown(&self) {
        let _guard = self.shutdown.lock().await;
        match self.state() {
            ConsumerState::Stopped => return,
            ConsumerState::Created => {
                self.connector.dispose();
                self.set_state(ConsumerState::Stopped);
                return;
            }
            _ => {}
        }
        self.set_state(ConsumerState::Unsubscribing);

        if let Some(listener_id) = self
            .reconnect_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.connector.remove_listener(listener_id);
        }

        // Stop inbound writes first
        if let Some(id) = self.subscription.lock().await.take() {
            if let Err(e) = self.connector.unsubscribe(id).await {
                tracing::debug!(error = %e, subject = %self.subject, "Unsubscribe failed");
            }
        }
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Complete the buffer and let the workers drain it
        self.gate
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        let drained_by = workers.len();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, subject = %self.subject, "Consumer worker failed");
            }
        }

        self.connector.dispose();
        self.set_state(ConsumerState::Stopped);

        tracing::info!(
            subject = %self.subject,
            group = %self.group,
            workers = drained_by,
            "Consumer stopped"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("callback panicked: {message}")
    } else {
        "callback panicked".to_string()
    }
}
