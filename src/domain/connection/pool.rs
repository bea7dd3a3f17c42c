//! Bounded pool of broker connections.
//!
//! Connections are handed out exclusively. A background maintenance task
//! prunes idle connections above the minimum size and replaces connections
//! whose session dropped, raising the reconnect event on the replaced
//! connection so bound connectors move to the fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{BackoffConfig, BrokerDriver, ExponentialBackoff, SessionState};
use crate::config::PersistentQueueOptions;
use crate::error::QueueError;
use crate::metrics::{names, MetricsCollector};

use super::{current_time_ms, Connection, PoolHealth};

/// Snapshot of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    pub idle: usize,
    pub disconnected: usize,
    pub pending: usize,
    pub min_size: usize,
    pub max_size: usize,
}

struct Retry {
    backoff: ExponentialBackoff,
    next_attempt_ms: i64,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Sessions being opened outside the lock
    pending: usize,
    /// Backoff per disconnected connection that failed to be replaced
    retries: HashMap<Uuid, Retry>,
}

/// A slot reserved for a connection being opened.
///
/// Dropping it gives the slot back, so a cancelled `acquire` never leaks
/// capacity.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.state();
            state.pending = state.pending.saturating_sub(1);
        }
        self.pool.available.notify_waiters();
    }
}

enum Checkout<'a> {
    Taken(Arc<Connection>),
    Reserved(Reservation<'a>),
    Full,
}

pub struct ConnectionPool {
    driver: Arc<dyn BrokerDriver>,
    options: PersistentQueueOptions,
    metrics: Arc<dyn MetricsCollector>,
    state: Mutex<PoolState>,
    /// Signalled on release, replacement, failed creation and close
    available: Notify,
    /// Signalled by session watchers when a connection drops
    disconnected: Arc<Notify>,
    /// Serializes prune and reconnect passes
    maintenance: tokio::sync::Mutex<()>,
    health: PoolHealth,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open `pool_min_size` connections and start the maintenance task
    pub async fn start(
        driver: Arc<dyn BrokerDriver>,
        options: PersistentQueueOptions,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Arc<Self>, QueueError> {
        options
            .validate()
            .map_err(|e| QueueError::InvalidOptions(e.to_string()))?;

        let pool = Arc::new(Self {
            driver,
            options,
            metrics,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            disconnected: Arc::new(Notify::new()),
            maintenance: tokio::sync::Mutex::new(()),
            health: PoolHealth::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = pool.top_up().await {
            tracing::error!(
                error = %e,
                address = %pool.driver.address(),
                "Failed to warm up connection pool"
            );
            pool.close().await;
            return Err(e);
        }

        let maintenance = Maintenance {
            pool: Arc::downgrade(&pool),
            cancel: pool.cancel.clone(),
            disconnected: pool.disconnected.clone(),
            prune_interval: pool.options.prune_interval(),
            reconnect_interval: pool.options.reconnect_interval(),
        };
        tokio::spawn(maintenance.run());

        tracing::info!(
            address = %pool.driver.address(),
            min_size = pool.options.pool_min_size,
            max_size = pool.options.pool_max_size,
            "Connection pool started"
        );

        Ok(pool)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &PersistentQueueOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics
    }

    pub fn address(&self) -> &str {
        self.driver.address()
    }

    pub fn health(&self) -> &PoolHealth {
        &self.health
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take an idle connection, open a new one, or wait for a release.
    ///
    /// Fails with `PoolExhausted` once `connection_timeout` elapsed without
    /// a connection becoming available.
    pub async fn acquire(&self) -> Result<Arc<Connection>, QueueError> {
        let timeout = self.options.connection_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_closed() {
                return Err(QueueError::PoolClosed);
            }

            // Register interest before looking so a release in between is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout() {
                Checkout::Taken(connection) => {
                    tracing::trace!(connection_id = %connection.id(), "Connection taken");
                    return Ok(connection);
                }
                Checkout::Reserved(reservation) => return self.open(reservation, true).await,
                Checkout::Full => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    max_size = self.options.pool_max_size,
                    "Connection pool exhausted"
                );
                return Err(QueueError::PoolExhausted(timeout));
            }
        }
    }

    fn checkout(&self) -> Checkout<'_> {
        let mut state = self.state();
        if let Some(connection) = state
            .connections
            .iter()
            .find(|c| c.is_connected() && c.try_take())
        {
            return Checkout::Taken(connection.clone());
        }
        if state.connections.len() + state.pending < self.options.pool_max_size {
            state.pending += 1;
            return Checkout::Reserved(Reservation { pool: self });
        }
        Checkout::Full
    }

    /// Open a session into a reserved slot
    async fn open(
        &self,
        reservation: Reservation<'_>,
        take: bool,
    ) -> Result<Arc<Connection>, QueueError> {
        let session = self.driver.connect().await.map_err(|e| {
            tracing::warn!(error = %e, address = %self.driver.address(), "Failed to open connection");
            QueueError::from(e)
        })?;

        let connection = Arc::new(Connection::new(session));
        if take {
            connection.try_take();
        }

        let size = {
            let mut state = self.state();
            if self.is_closed() {
                None
            } else {
                state.connections.push(connection.clone());
                Some(state.connections.len())
            }
        };
        drop(reservation);

        let Some(size) = size else {
            let _ = connection.session().disconnect().await;
            return Err(QueueError::PoolClosed);
        };

        self.watch(&connection);
        self.metrics
            .histogram(names::POOL_SIZE, size as f64, &[], None);
        tracing::debug!(connection_id = %connection.id(), size, "Connection opened");

        Ok(connection)
    }

    /// Open idle connections until the pool holds `pool_min_size`
    async fn top_up(&self) -> Result<usize, QueueError> {
        let mut opened = 0;
        loop {
            let reservation = {
                let mut state = self.state();
                if state.connections.len() + state.pending >= self.options.pool_min_size {
                    break;
                }
                state.pending += 1;
                Reservation { pool: self }
            };
            self.open(reservation, false).await?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Return a connection to the pool.
    ///
    /// A connection replaced by the reconnect loop releases its successor.
    /// Releasing a connection that is not taken only logs a warning.
    pub fn release(&self, connection: &Arc<Connection>) {
        match connection.release() {
            Some(held) => {
                self.metrics
                    .histogram(names::CONNECTION_USAGE, held.as_secs_f64(), &[], None);
                tracing::trace!(
                    connection_id = %connection.latest().id(),
                    held_ms = held.as_millis() as u64,
                    "Connection released"
                );
                self.available.notify_waiters();
            }
            None => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    "Connection released while not taken"
                );
            }
        }
    }

    /// Forward the session's disconnect event to the maintenance task
    fn watch(&self, connection: &Arc<Connection>) {
        let mut state = connection.session().state();
        let disconnected = self.disconnected.clone();
        let cancel = self.cancel.clone();
        let connection_id = connection.id();

        tokio::spawn(async move {
            loop {
                if *state.borrow_and_update() == SessionState::Disconnected {
                    tracing::warn!(connection_id = %connection_id, "Connection lost");
                    disconnected.notify_one();
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Run one prune pass now.
    ///
    /// Closes idle connections released longer than `idle_time` ago without
    /// going below `pool_min_size`, then tops the pool back up to the
    /// minimum. Returns the number of connections closed.
    pub async fn prune(&self) -> usize {
        let _pass = self.maintenance.lock().await;
        if self.is_closed() {
            return 0;
        }

        let now = current_time_ms();
        let idle_time = self.options.idle_time();
        let (removed, size) = {
            let mut state = self.state();
            let min_size = self.options.pool_min_size;
            let mut remaining = state.connections.len();
            let mut removed = Vec::new();
            state.connections.retain(|c| {
                if remaining > min_size && !c.is_busy() && c.idle_for(now) >= idle_time {
                    remaining -= 1;
                    removed.push(c.clone());
                    false
                } else {
                    true
                }
            });
            for connection in &removed {
                state.retries.remove(&connection.id());
            }
            (removed, state.connections.len())
        };

        for connection in &removed {
            if let Err(e) = connection.session().disconnect().await {
                tracing::debug!(error = %e, connection_id = %connection.id(), "Disconnect failed");
            }
        }

        if !removed.is_empty() {
            self.metrics
                .histogram(names::POOL_SIZE, size as f64, &[], None);
            tracing::info!(pruned = removed.len(), size, "Pruned idle connections");
        }

        match self.top_up().await {
            Ok(0) => {}
            Ok(opened) => tracing::info!(opened, "Topped pool up to minimum size"),
            Err(e) => tracing::warn!(error = %e, "Failed to top pool up to minimum size"),
        }

        removed.len()
    }

    /// Run one reconnect pass now.
    ///
    /// Every disconnected connection whose backoff elapsed is replaced in
    /// place by a fresh session. The replacement inherits the busy flag and
    /// the old connection's reconnect listeners are invoked with it. Returns
    /// the number of connections replaced.
    pub async fn reconnect(&self) -> usize {
        let _pass = self.maintenance.lock().await;
        if self.is_closed() {
            return 0;
        }

        let now = current_time_ms();
        let stale: Vec<Arc<Connection>> = {
            let state = self.state();
            state
                .connections
                .iter()
                .filter(|c| !c.is_connected())
                .filter(|c| {
                    state
                        .retries
                        .get(&c.id())
                        .map_or(true, |r| r.next_attempt_ms <= now)
                })
                .cloned()
                .collect()
        };

        let mut replaced = 0;
        for old in stale {
            if self.is_closed() {
                break;
            }
            self.health.set_reconnecting();

            let session = match self.driver.connect().await {
                Ok(session) => session,
                Err(e) => {
                    let (attempt, delay) = self.schedule_retry(old.id());
                    tracing::warn!(
                        error = %e,
                        connection_id = %old.id(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to replace disconnected connection"
                    );
                    continue;
                }
            };

            let fresh = Arc::new(Connection::new(session));
            let listeners = {
                let mut state = self.state();
                let slot = state.connections.iter().position(|c| Arc::ptr_eq(c, &old));
                match slot {
                    Some(slot) if !self.is_closed() => {
                        let listeners = old.hand_over(&fresh);
                        state.connections[slot] = fresh.clone();
                        state.retries.remove(&old.id());
                        Some(listeners)
                    }
                    _ => None,
                }
            };

            let Some(listeners) = listeners else {
                // Pruned or closed while the session was being opened
                let _ = fresh.session().disconnect().await;
                continue;
            };

            replaced += 1;
            self.health.set_connected();
            self.metrics.meter(names::RECONNECTIONS, 1.0, &[], None);
            self.watch(&fresh);

            tracing::info!(
                old_connection_id = %old.id(),
                connection_id = %fresh.id(),
                busy = fresh.is_busy(),
                listeners = listeners.len(),
                "Connection replaced"
            );

            for listener in listeners {
                listener(&fresh);
            }

            let _ = old.session().disconnect().await;
            self.available.notify_waiters();
        }

        replaced
    }

    fn schedule_retry(&self, connection_id: Uuid) -> (u32, Duration) {
        let interval = self.options.reconnect_interval();
        let mut state = self.state();
        let retry = state.retries.entry(connection_id).or_insert_with(|| Retry {
            backoff: ExponentialBackoff::with_config(BackoffConfig::from_interval(interval)),
            next_attempt_ms: 0,
        });
        let delay = retry.backoff.next_delay();
        retry.next_attempt_ms = current_time_ms() + delay.as_millis() as i64;
        (retry.backoff.attempt(), delay)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let busy = state.connections.iter().filter(|c| c.is_busy()).count();
        let disconnected = state
            .connections
            .iter()
            .filter(|c| !c.is_connected())
            .count();
        PoolStats {
            size: state.connections.len(),
            busy,
            idle: state.connections.len() - busy,
            disconnected,
            pending: state.pending,
            min_size: self.options.pool_min_size,
            max_size: self.options.pool_max_size,
        }
    }

    /// Snapshot of the pooled connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state().connections.clone()
    }

    pub fn size(&self) -> usize {
        self.state().connections.len()
    }

    /// Stop maintenance and disconnect every session.
    ///
    /// Pending and future `acquire` calls fail with `PoolClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.health.set_closed();

        let connections = std::mem::take(&mut self.state().connections);
        for connection in &connections {
            if let Err(e) = connection.session().disconnect().await {
                tracing::debug!(error = %e, connection_id = %connection.id(), "Disconnect failed");
            }
        }
        self.available.notify_waiters();

        tracing::info!(
            address = %self.driver.address(),
            closed = connections.len(),
            "Connection pool closed"
        );
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background prune/reconnect loop, stops when the pool is dropped or closed
struct Maintenance {
    pool: Weak<ConnectionPool>,
    cancel: CancellationToken,
    disconnected: Arc<Notify>,
    prune_interval: Duration,
    reconnect_interval: Duration,
}

impl Maintenance {
    async fn run(self) {
        let mut prune_timer = tokio::time::interval(self.prune_interval);
        let mut reconnect_timer = tokio::time::interval(self.reconnect_interval);

        // Skip immediate first tick
        prune_timer.tick().await;
        reconnect_timer.tick().await;

        tracing::debug!(
            prune_interval_ms = self.prune_interval.as_millis() as u64,
            reconnect_interval_ms = self.reconnect_interval.as_millis() as u64,
            "Pool maintenance started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = prune_timer.tick() => {
                    let Some(pool) = self.pool.upgrade() else { break };
                    pool.prune().await;
                }
                _ = reconnect_timer.tick() => {
                    let Some(pool) = self.pool.upgrade() else { break };
                    pool.reconnect().await;
                }
                _ = self.disconnected.notified() => {
                    let Some(pool) = self.pool.upgrade() else { break };
                    pool.reconnect().await;
                }
            }
        }

        tracing::debug!("Pool maintenance stopped");
    }
}
