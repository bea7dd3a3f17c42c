use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::BrokerDriver;
use crate::config::PersistentQueueOptions;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

use super::PersistentQueue;

/// Queues keyed by broker address.
///
/// Two lookups for the same address share one pool. The registry is an
/// ordinary value owned by the host, not a process-wide static.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<PersistentQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `driver.address()`, connecting on first use.
    ///
    /// `options` and `metrics` only apply when a new pool is started.
    pub async fn get_or_connect(
        &self,
        driver: Arc<dyn BrokerDriver>,
        options: PersistentQueueOptions,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Arc<PersistentQueue>, QueueError> {
        let address = driver.address().to_string();
        let mut queues = self.queues.lock().await;

        if let Some(queue) = queues.get(&address) {
            if !queue.is_closed() {
                return Ok(queue.clone());
            }
            tracing::debug!(address = %address, "Replacing closed queue");
        }

        let queue = PersistentQueue::connect(driver, options, metrics).await?;
        queues.insert(address.clone(), queue.clone());
        tracing::info!(address = %address, "Queue registered");
        Ok(queue)
    }

    pub async fn get(&self, address: &str) -> Option<Arc<PersistentQueue>> {
        self.queues.lock().await.get(address).cloned()
    }

    /// Remove and close the queue for `address`
    pub async fn remove(&self, address: &str) -> bool {
        let removed = self.queues.lock().await.remove(address);
        match removed {
            Some(queue) => {
                queue.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.is_empty()
    }

    /// Close every registered queue
    pub async fn close_all(&self) {
        let queues: Vec<_> = self.queues.lock().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::broker::InMemoryBroker;
    use crate::metrics::NoopMetrics;

    fn options() -> PersistentQueueOptions {
        PersistentQueueOptions {
            pool_min_size: 1,
            pool_max_size: 2,
            ..PersistentQueueOptions::default()
        }
    }

    #[tokio::test]
    async fn test_same_address_shares_queue() {
        let registry = QueueRegistry::new();
        let broker = Arc::new(InMemoryBroker::with_address("memory://a"));

        let first = registry
            .get_or_connect(broker.clone(), options(), Arc::new(NoopMetrics))
            .await
            .unwrap();
        let second = registry
            .get_or_connect(broker.clone(), options(), Arc::new(NoopMetrics))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses() {
        let registry = QueueRegistry::new();
        let a = Arc::new(InMemoryBroker::with_address("memory://a"));
        let b = Arc::new(InMemoryBroker::with_address("memory://b"));

        registry
            .get_or_connect(a, options(), Arc::new(NoopMetrics))
            .await
            .unwrap();
        registry
            .get_or_connect(b, options(), Arc::new(NoopMetrics))
            .await
            .unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("memory://b").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_closes_queue() {
        let registry = QueueRegistry::new();
        let broker = Arc::new(InMemoryBroker::with_address("memory://a"));
        let queue = registry
            .get_or_connect(broker, options(), Arc::new(NoopMetrics))
            .await
            .unwrap();

        assert!(registry.remove("memory://a").await);
        assert!(queue.is_closed());
        assert!(registry.is_empty().await);
        assert!(!registry.remove("memory://a").await);
    }

    #[tokio::test]
    async fn test_closed_queue_replaced() {
        let registry = QueueRegistry::new();
        let broker = Arc::new(InMemoryBroker::with_address("memory://a"));

        let first = registry
            .get_or_connect(broker.clone(), options(), Arc::new(NoopMetrics))
            .await
            .unwrap();
        first.close().await;

        let second = registry
            .get_or_connect(broker, options(), Arc::new(NoopMetrics))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }
}
