//! Connector: a lease on one pooled connection that survives reconnects

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use crate::broker::{
    BrokerError, BrokerSession, Delivery, DeliveryHandler, SubscribeOptions, SubscriptionId,
};
use crate::error::QueueError;

use super::{Connection, ConnectionPool, ListenerId, ReconnectListener, Registration};

#[derive(Clone)]
struct Binding {
    connection: Arc<Connection>,
    /// Our listener on `connection`'s reconnect event
    listener: Option<ListenerId>,
}

/// Binds a producer or consumer to exactly one pooled connection.
///
/// When the pool replaces the connection after a disconnect, the connector
/// rebinds to the replacement and then invokes its own reconnect listeners
/// once each, so owners can restore subscriptions.
pub struct Connector {
    id: Uuid,
    message_type: String,
    pool: Arc<ConnectionPool>,
    binding: RwLock<Binding>,
    listeners: DashMap<ListenerId, ReconnectListener>,
    disposed: AtomicBool,
    this: Weak<Connector>,
}

impl Connector {
    /// Acquire a connection from `pool` and bind to it
    pub async fn lease(
        pool: Arc<ConnectionPool>,
        message_type: impl Into<String>,
    ) -> Result<Arc<Self>, QueueError> {
        let connection = pool.acquire().await?;
        let connector = Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            pool,
            binding: RwLock::new(Binding {
                connection: connection.clone(),
                listener: None,
            }),
            listeners: DashMap::new(),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        });
        connector.bind(connection);

        tracing::debug!(
            connector_id = %connector.id,
            message_type = %connector.message_type,
            connection_id = %connector.connection().id(),
            "Connector leased"
        );

        Ok(connector)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The connection currently bound
    pub fn connection(&self) -> Arc<Connection> {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connection
            .clone()
    }

    /// Make `connection` current and listen for its replacement.
    ///
    /// If `connection` was already replaced, binds to the newest connection
    /// of its replacement chain instead.
    pub fn bind(&self, connection: Arc<Connection>) {
        let mut connection = connection;
        loop {
            let this = self.this.clone();
            let listener: ReconnectListener = Arc::new(move |next: &Arc<Connection>| {
                if let Some(connector) = this.upgrade() {
                    connector.rebind(next.clone());
                }
            });

            match connection.on_reconnect(listener) {
                Registration::Registered(listener_id) => {
                    *self.binding.write().unwrap_or_else(PoisonError::into_inner) = Binding {
                        connection,
                        listener: Some(listener_id),
                    };
                    return;
                }
                Registration::Replaced(next) => connection = next,
            }
        }
    }

    /// Swap the current connection and notify every listener once.
    ///
    /// Driven by the pool's reconnect event, which moves the lease to the
    /// successor. The previous connection is not released here.
    pub(crate) fn rebind(&self, connection: Arc<Connection>) {
        if self.is_disposed() {
            return;
        }

        let previous = self
            .binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if Arc::ptr_eq(&previous.connection, &connection) {
            return;
        }
        if let Some(listener_id) = previous.listener {
            previous.connection.remove_listener(listener_id);
        }

        self.bind(connection);
        let current = self.connection();

        tracing::info!(
            connector_id = %self.id,
            message_type = %self.message_type,
            old_connection_id = %previous.connection.id(),
            connection_id = %current.id(),
            "Connector rebound"
        );

        let listeners: Vec<ReconnectListener> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener(&current);
        }
    }

    /// Register a listener invoked after every rebind
    pub fn on_reconnect(&self, listener: ReconnectListener) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    fn session(&self) -> Result<Arc<dyn BrokerSession>, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::InvalidState(format!(
                "connector {} is disposed",
                self.id
            )));
        }
        Ok(self.connection().session().clone())
    }

    fn lost(&self, e: BrokerError) -> QueueError {
        match e {
            BrokerError::Disconnected => QueueError::ConnectionLost(format!(
                "connection {} of {}",
                self.connection().id(),
                self.message_type
            )),
            other => QueueError::Broker(other),
        }
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        self.session()?
            .publish(subject, payload)
            .await
            .map_err(|e| self.lost(e))
    }

    pub async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, QueueError> {
        self.session()?
            .subscribe(subject, options, handler)
            .await
            .map_err(|e| self.lost(e))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), QueueError> {
        self.session()?
            .unsubscribe(id)
            .await
            .map_err(|e| self.lost(e))
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.session()?
            .ack(delivery)
            .await
            .map_err(|e| self.lost(e))
    }

    /// Release the connection back to the pool. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let binding = self
            .binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener_id) = binding.listener {
            binding.connection.remove_listener(listener_id);
        }
        self.listeners.clear();
        self.pool.release(&binding.connection);

        tracing::debug!(
            connector_id = %self.id,
            message_type = %self.message_type,
            connection_id = %binding.connection.id(),
            "Connector disposed"
        );
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.dispose();
    }
}
