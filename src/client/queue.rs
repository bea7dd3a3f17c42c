use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::broker::BrokerDriver;
use crate::config::PersistentQueueOptions;
use crate::connection::{
    ConnectionPool, HealthCheck, HealthReport, PoolHealthCheck, PoolStats,
};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::QueueError;
use crate::message::Message;
use crate::metrics::MetricsCollector;
use crate::producer::Producer;

/// Entry point bound to one broker: owns the connection pool and hands out
/// producers and consumers that lease connections from it.
pub struct PersistentQueue {
    pool: Arc<ConnectionPool>,
    health: PoolHealthCheck,
    producers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl PersistentQueue {
    /// Start a pool against `driver` and warm it up
    pub async fn connect(
        driver: Arc<dyn BrokerDriver>,
        options: PersistentQueueOptions,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Arc<Self>, QueueError> {
        let pool = ConnectionPool::start(driver, options, metrics).await?;
        Ok(Arc::new(Self::with_pool(pool)))
    }

    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self {
            health: PoolHealthCheck::new(pool.clone()),
            pool,
            producers: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn address(&self) -> &str {
        self.pool.address()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shared producer for `M`, created on first use
    pub async fn producer<M: Message>(&self) -> Result<Arc<Producer<M>>, QueueError> {
        if self.pool.is_closed() {
            return Err(QueueError::PoolClosed);
        }

        let key = TypeId::of::<M>();
        if let Some(existing) = self.cached_producer::<M>(&key) {
            return Ok(existing);
        }

        let created: Arc<dyn Any + Send + Sync> =
            Arc::new(Producer::<M>::new(self.pool.clone()).await?);
        // A concurrent caller may have won; keep whichever was stored first
        let stored = self.producers.entry(key).or_insert(created).clone();

        stored.downcast::<Producer<M>>().map_err(|_| {
            QueueError::InvalidState(format!(
                "producer cache holds another type for {}",
                M::message_type()
            ))
        })
    }

    fn cached_producer<M: Message>(&self, key: &TypeId) -> Option<Arc<Producer<M>>> {
        let entry = self.producers.get(key)?.clone();
        entry.downcast::<Producer<M>>().ok()
    }

    /// New consumer for `M`; every call leases its own connector
    pub async fn consumer<M: Message>(
        &self,
        options: ConsumerOptions,
    ) -> Result<Consumer<M>, QueueError> {
        if self.pool.is_closed() {
            return Err(QueueError::PoolClosed);
        }
        Consumer::new(self.pool.clone(), options).await
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Release cached producers and close the pool
    pub async fn close(&self) {
        self.producers.clear();
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait]
impl HealthCheck for PersistentQueue {
    async fn check_health(&self) -> HealthReport {
        self.health.check_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::{Deserialize, Serialize};

    use crate::broker::InMemoryBroker;
    use crate::metrics::NoopMetrics;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        fn message_type() -> &'static str {
            "Ping"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        fn message_type() -> &'static str {
            "Pong"
        }
    }

    async fn queue(broker: &InMemoryBroker) -> Arc<PersistentQueue> {
        let options = PersistentQueueOptions {
            pool_min_size: 1,
            pool_max_size: 4,
            ..PersistentQueueOptions::default()
        };
        PersistentQueue::connect(Arc::new(broker.clone()), options, Arc::new(NoopMetrics))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_producer_cached_per_type() {
        let broker = InMemoryBroker::new();
        let queue = queue(&broker).await;

        let a = queue.producer::<Ping>().await.unwrap();
        let b = queue.producer::<Ping>().await.unwrap();
        let c = queue.producer::<Pong>().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.subject(), "Pong");
        assert_eq!(queue.producer_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_new_clients() {
        let broker = InMemoryBroker::new();
        let queue = queue(&broker).await;

        queue.close().await;
        assert!(queue.is_closed());
        assert!(matches!(
            queue.producer::<Ping>().await,
            Err(QueueError::PoolClosed)
        ));
        assert!(matches!(
            queue.consumer::<Ping>(ConsumerOptions::default()).await,
            Err(QueueError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_health_follows_pool() {
        let broker = InMemoryBroker::new();
        let queue = queue(&broker).await;

        let report = queue.check_health().await;
        assert!(report.is_healthy());
        assert_eq!(report.pool.size, 1);

        queue.close().await;
        assert!(!queue.check_health().await.is_healthy());
    }
}
