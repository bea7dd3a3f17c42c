//! In-process broker driver.
//!
//! Behaves like a small durable broker: subjects fan out to every ungrouped
//! subscription and to one member (round-robin) of each consumer group.
//! Deliveries on manual-ack group subscriptions stay pending until acked and
//! can be redelivered. Sessions can be severed to simulate network failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    BrokerDriver, BrokerError, BrokerSession, Delivery, DeliveryHandler, SessionState,
    SubscribeOptions, SubscriptionId,
};

type GroupKey = (String, String);

#[derive(Clone)]
struct Route {
    id: SubscriptionId,
    session_id: Uuid,
    options: SubscribeOptions,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Topology {
    routes: HashMap<String, Vec<Route>>,
    cursors: HashMap<GroupKey, usize>,
    pending: HashMap<GroupKey, BTreeMap<u64, Bytes>>,
}

impl Topology {
    /// Pick the next member of `group` on `subject`
    fn next_member(&mut self, subject: &str, group: &str) -> Option<Route> {
        let members: Vec<Route> = self
            .routes
            .get(subject)?
            .iter()
            .filter(|r| r.options.group.as_deref() == Some(group))
            .cloned()
            .collect();
        if members.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry((subject.to_string(), group.to_string()))
            .or_insert(0);
        let route = members[*cursor % members.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(route)
    }
}

struct SessionShared {
    id: Uuid,
    connected: AtomicBool,
    state: watch::Sender<SessionState>,
}

impl SessionShared {
    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.state.send_replace(SessionState::Disconnected);
    }
}

struct BrokerState {
    address: String,
    available: AtomicBool,
    sequence: AtomicU64,
    published: AtomicU64,
    acked: AtomicU64,
    topology: Mutex<Topology>,
    sessions: Mutex<HashMap<Uuid, Arc<SessionShared>>>,
}

impl BrokerState {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SessionShared>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sever(&self, session: &SessionShared) {
        session.mark_disconnected();
        self.sessions().remove(&session.id);

        let mut topology = self.topology();
        for routes in topology.routes.values_mut() {
            routes.retain(|r| r.session_id != session.id);
        }
        topology.routes.retain(|_, routes| !routes.is_empty());
    }
}

/// In-process broker, cheap to clone
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_address("memory://local")
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerState {
                address: address.into(),
                available: AtomicBool::new(true),
                sequence: AtomicU64::new(0),
                published: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                topology: Mutex::new(Topology::default()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Refuse (or accept again) new sessions
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Drop every open session as if the network failed.
    ///
    /// Returns the number of sessions severed.
    pub fn sever_all(&self) -> usize {
        let sessions: Vec<Arc<SessionShared>> = self.inner.sessions().values().cloned().collect();
        for session in &sessions {
            self.inner.sever(session);
        }
        tracing::debug!(severed = sessions.len(), "Severed in-memory sessions");
        sessions.len()
    }

    /// Number of sessions currently connected
    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Number of live subscriptions on `subject`
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.inner
            .topology()
            .routes
            .get(subject)
            .map_or(0, Vec::len)
    }

    /// Number of live subscriptions on subjects starting with `prefix`
    pub fn subscriptions_with_prefix(&self, prefix: &str) -> usize {
        self.inner
            .topology()
            .routes
            .iter()
            .filter(|(subject, _)| subject.starts_with(prefix))
            .map(|(_, routes)| routes.len())
            .sum()
    }

    /// Deliveries waiting for an ack on `subject` for `group`
    pub fn pending_count(&self, subject: &str, group: &str) -> usize {
        self.inner
            .topology()
            .pending
            .get(&(subject.to_string(), group.to_string()))
            .map_or(0, BTreeMap::len)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }

    pub fn acked_count(&self) -> u64 {
        self.inner.acked.load(Ordering::Acquire)
    }

    /// Redeliver every unacked message of `group` on `subject`.
    ///
    /// Returns the number of deliveries handed to group members.
    pub fn redeliver_pending(&self, subject: &str, group: &str) -> usize {
        let mut deliveries = Vec::new();
        {
            let mut topology = self.inner.topology();
            let pending: Vec<(u64, Bytes)> = topology
                .pending
                .get(&(subject.to_string(), group.to_string()))
                .map(|p| p.iter().map(|(seq, data)| (*seq, data.clone())).collect())
                .unwrap_or_default();

            for (seq, data) in pending {
                let Some(route) = topology.next_member(subject, group) else {
                    break;
                };
                deliveries.push((
                    route.tx,
                    Delivery {
                        subject: subject.to_string(),
                        group: Some(group.to_string()),
                        token: seq.to_string(),
                        data,
                    },
                ));
            }
        }

        let count = deliveries.len();
        for (tx, delivery) in deliveries {
            let _ = tx.send(delivery);
        }
        count
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerDriver for InMemoryBroker {
    fn address(&self) -> &str {
        &self.inner.address
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(BrokerError::Unavailable(self.inner.address.clone()));
        }

        let (state, _) = watch::channel(SessionState::Connected);
        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            connected: AtomicBool::new(true),
            state,
        });
        self.inner.sessions().insert(shared.id, shared.clone());

        tracing::debug!(session_id = %shared.id, "In-memory session opened");

        Ok(Arc::new(MemorySession {
            shared,
            broker: self.inner.clone(),
        }))
    }
}

/// Session on an `InMemoryBroker`
pub struct MemorySession {
    shared: Arc<SessionShared>,
    broker: Arc<BrokerState>,
}

impl MemorySession {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, BrokerError> {
        self.ensure_connected()?;

        let id = SubscriptionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        // One delivery task per subscription keeps handler calls sequential
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery).await;
            }
        });

        self.broker
            .topology()
            .routes
            .entry(subject.to_string())
            .or_default()
            .push(Route {
                id,
                session_id: self.shared.id,
                options,
                tx,
            });

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let mut topology = self.broker.topology();
        let mut found = false;
        for routes in topology.routes.values_mut() {
            let before = routes.len();
            routes.retain(|r| r.id != id);
            found |= routes.len() != before;
        }
        topology.routes.retain(|_, routes| !routes.is_empty());

        if found {
            Ok(())
        } else {
            Err(BrokerError::SubscriptionNotFound(id))
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let seq = self.broker.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let mut targets = Vec::new();
        {
            let mut topology = self.broker.topology();
            let routes = topology.routes.get(subject).cloned().unwrap_or_default();

            let mut groups: Vec<String> = Vec::new();
            for route in routes {
                match &route.options.group {
                    None => targets.push(route),
                    Some(group) if !groups.contains(group) => groups.push(group.clone()),
                    Some(_) => {}
                }
            }

            for group in groups {
                if let Some(route) = topology.next_member(subject, &group) {
                    if route.options.manual_ack {
                        topology
                            .pending
                            .entry((subject.to_string(), group))
                            .or_default()
                            .insert(seq, payload.clone());
                    }
                    targets.push(route);
                }
            }
        }

        self.broker.published.fetch_add(1, Ordering::AcqRel);

        for route in targets {
            let _ = route.tx.send(Delivery {
                subject: subject.to_string(),
                group: route.options.group.clone(),
                token: seq.to_string(),
                data: payload.clone(),
            });
        }

        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let Some(group) = &delivery.group else {
            return Ok(());
        };
        let Ok(seq) = delivery.token.parse::<u64>() else {
            return Ok(());
        };

        let removed = self
            .broker
            .topology()
            .pending
            .get_mut(&(delivery.subject.clone(), group.clone()))
            .and_then(|pending| pending.remove(&seq))
            .is_some();

        if removed {
            self.broker.acked.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.broker.sever(&self.shared);
        tracing::debug!(session_id = %self.shared.id, "In-memory session closed");
        Ok(())
    }
}
