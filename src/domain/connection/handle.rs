//! A pooled broker connection

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::BrokerSession;

use super::current_time_ms;

/// Called with the replacement once a connection has been swapped out
pub type ReconnectListener = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome of `Connection::on_reconnect`
pub enum Registration {
    Registered(ListenerId),
    /// The connection was already replaced; bind to this one instead
    Replaced(Arc<Connection>),
}

#[derive(Default)]
struct Lineage {
    successor: Option<Arc<Connection>>,
    listeners: HashMap<ListenerId, ReconnectListener>,
}

/// One broker session plus the bookkeeping the pool needs.
///
/// `busy` only changes through `try_take`/`release`, both compare-and-swap
/// guarded, so a connection is never handed out twice.
pub struct Connection {
    id: Uuid,
    created_at: DateTime<Utc>,
    last_take: AtomicI64,
    last_release: AtomicI64,
    busy: AtomicBool,
    session: Arc<dyn BrokerSession>,
    lineage: Mutex<Lineage>,
}

impl Connection {
    pub fn new(session: Arc<dyn BrokerSession>) -> Self {
        let now = current_time_ms();
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_take: AtomicI64::new(now),
            last_release: AtomicI64::new(now),
            busy: AtomicBool::new(false),
            session,
            lineage: Mutex::new(Lineage::default()),
        }
    }

    fn lineage(&self) -> MutexGuard<'_, Lineage> {
        self.lineage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_take_ms(&self) -> i64 {
        self.last_take.load(Ordering::Acquire)
    }

    pub fn last_release_ms(&self) -> i64 {
        self.last_release.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the underlying session reports connected
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    /// Time since the last release, zero while taken
    pub fn idle_for(&self, now_ms: i64) -> Duration {
        if self.is_busy() {
            return Duration::ZERO;
        }
        let idle = now_ms.saturating_sub(self.last_release_ms()).max(0);
        Duration::from_millis(idle as u64)
    }

    /// Mark the connection taken. Fails if someone else holds it.
    pub(crate) fn try_take(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.last_take.store(current_time_ms(), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Mark the connection idle.
    ///
    /// Follows the successor chain when the connection was replaced, so the
    /// holder of a stale handle releases the connection that inherited its
    /// lease. Returns how long it was held, or `None` if it was not taken.
    pub(crate) fn release(&self) -> Option<Duration> {
        let lineage = self.lineage();
        if let Some(successor) = lineage.successor.clone() {
            drop(lineage);
            return successor.release();
        }

        self.busy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let now = current_time_ms();
        self.last_release.store(now, Ordering::Release);
        drop(lineage);

        let held = now.saturating_sub(self.last_take_ms()).max(0);
        Some(Duration::from_millis(held as u64))
    }

    /// Register a listener for the reconnect event.
    ///
    /// Listeners fire once, when the pool swaps this connection for a fresh
    /// one, and receive the replacement.
    pub fn on_reconnect(&self, listener: ReconnectListener) -> Registration {
        let mut lineage = self.lineage();
        if let Some(successor) = &lineage.successor {
            return Registration::Replaced(successor.clone());
        }
        let id = ListenerId::next();
        lineage.listeners.insert(id, listener);
        Registration::Registered(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lineage().listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.lineage().listeners.len()
    }

    /// Newest connection in the replacement chain
    pub fn latest(self: &Arc<Self>) -> Arc<Connection> {
        let mut current = self.clone();
        loop {
            let next = current.lineage().successor.clone();
            match next {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    /// Transfer the lease to `successor` and detach the listeners.
    ///
    /// The caller raises the reconnect event by invoking the returned
    /// listeners once `successor` is reachable from the pool.
    pub(crate) fn hand_over(&self, successor: &Arc<Connection>) -> Vec<ReconnectListener> {
        let mut lineage = self.lineage();
        successor
            .busy
            .store(self.busy.load(Ordering::Acquire), Ordering::Release);
        successor
            .last_take
            .store(self.last_take_ms(), Ordering::Release);
        lineage.successor = Some(successor.clone());
        lineage.listeners.drain().map(|(_, l)| l).collect()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("busy", &self.is_busy())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::broker::{BrokerDriver, InMemoryBroker};

    async fn connection(broker: &InMemoryBroker) -> Arc<Connection> {
        Arc::new(Connection::new(broker.connect().await.unwrap()))
    }

    #[tokio::test]
    async fn test_take_is_exclusive() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker).await;

        assert!(conn.try_take());
        assert!(!conn.try_take());
        assert!(conn.release().is_some());
        assert!(conn.release().is_none());
        assert!(!conn.is_busy());
    }

    #[tokio::test]
    async fn test_hand_over_moves_lease_and_listeners() {
        let broker = InMemoryBroker::new();
        let old = connection(&broker).await;
        let new = connection(&broker).await;
        let fired = Arc::new(AtomicUsize::new(0));

        assert!(old.try_take());
        let counter = fired.clone();
        let listener: ReconnectListener = Arc::new(move |_: &Arc<Connection>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(old.on_reconnect(listener), Registration::Registered(_)));

        let listeners = old.hand_over(&new);
        for listener in &listeners {
            listener(&new);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(new.is_busy());
        assert_eq!(old.listener_count(), 0);
        assert_eq!(old.latest().id(), new.id());

        // Releasing through the stale handle frees the successor
        assert!(old.release().is_some());
        assert!(!new.is_busy());
    }

    #[tokio::test]
    async fn test_registration_after_replacement() {
        let broker = InMemoryBroker::new();
        let old = connection(&broker).await;
        let new = connection(&broker).await;
        old.hand_over(&new);

        let noop: ReconnectListener = Arc::new(|_: &Arc<Connection>| {});
        match old.on_reconnect(noop) {
            Registration::Replaced(next) => assert_eq!(next.id(), new.id()),
            Registration::Registered(_) => panic!("expected replacement"),
        }
    }

    #[tokio::test]
    async fn test_remove_listener_only_removes_one() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker).await;

        let noop: ReconnectListener = Arc::new(|_: &Arc<Connection>| {});

        let Registration::Registered(first) = conn.on_reconnect(noop.clone()) else {
            panic!("not registered");
        };
        let Registration::Registered(_second) = conn.on_reconnect(noop) else {
            panic!("not registered");
        };

        assert!(conn.remove_listener(first));
        assert!(!conn.remove_listener(first));
        assert_eq!(conn.listener_count(), 1);
    }
}
