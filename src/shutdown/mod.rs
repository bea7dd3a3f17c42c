//! Graceful shutdown handling for queue clients.
//!
//! Registered components are drained in registration order:
//! 1. Consumers stop receiving and finish every buffered message
//! 2. Producers and queues release their connections
//! 3. Pools close their broker sessions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::client::{PersistentQueue, QueueRegistry};
use crate::consumer::Consumer;
use crate::message::Message;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time each component gets to drain (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Something that must finish its work before the process exits
#[async_trait]
pub trait Drainable: Send + Sync {
    fn name(&self) -> String;

    async fn drain(&self);
}

#[async_trait]
impl<M: Message> Drainable for Consumer<M> {
    fn name(&self) -> String {
        format!("consumer:{}", M::message_type())
    }

    async fn drain(&self) {
        self.dispose().await;
    }
}

#[async_trait]
impl Drainable for PersistentQueue {
    fn name(&self) -> String {
        format!("queue:{}", self.address())
    }

    async fn drain(&self) {
        self.close().await;
    }
}

#[async_trait]
impl Drainable for QueueRegistry {
    fn name(&self) -> String {
        "queue-registry".to_string()
    }

    async fn drain(&self) {
        self.close_all().await;
    }
}

/// Drains registered components in order
pub struct GracefulShutdown {
    components: Vec<Arc<dyn Drainable>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_config(ShutdownConfig::default())
    }

    pub fn with_config(config: ShutdownConfig) -> Self {
        Self {
            components: Vec::new(),
            config,
        }
    }

    /// Register a component; earlier registrations drain first
    pub fn register(&mut self, component: Arc<dyn Drainable>) -> &mut Self {
        self.components.push(component);
        self
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(components = self.components.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown");

        for component in &self.components {
            let name = component.name();
            match timeout(self.config.drain_timeout, component.drain()).await {
                Ok(()) => {
                    tracing::info!(component = %name, "Component drained");
                    result.drained += 1;
                }
                Err(_) => {
                    tracing::warn!(
                        component = %name,
                        timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "Drain timeout, in-flight work may be redelivered"
                    );
                    result.timed_out.push(name);
                }
            }
        }

        result.duration = start.elapsed();
        result.success = result.timed_out.is_empty();

        tracing::info!(
            drained = result.drained,
            timed_out = result.timed_out.len(),
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every component drained within its timeout
    pub success: bool,
    /// Number of components that drained
    pub drained: usize,
    /// Components that hit the drain timeout
    pub timed_out: Vec<String>,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Drainable for Recorder {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn drain(&self) {
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[tokio::test]
    async fn test_shutdown_no_components() {
        let shutdown = GracefulShutdown::new();
        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.drained, 0);
    }

    #[tokio::test]
    async fn test_drains_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut shutdown = GracefulShutdown::new();
        shutdown
            .register(Arc::new(Recorder {
                name: "consumer",
                delay: Duration::from_millis(20),
                log: log.clone(),
            }))
            .register(Arc::new(Recorder {
                name: "queue",
                delay: Duration::ZERO,
                log: log.clone(),
            }));

        let result = shutdown.execute("test").await;
        assert!(result.success);
        assert_eq!(result.drained, 2);
        assert_eq!(*log.lock().unwrap(), vec!["consumer", "queue"]);
    }

    #[tokio::test]
    async fn test_slow_component_times_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut shutdown = GracefulShutdown::with_config(ShutdownConfig {
            drain_timeout: Duration::from_millis(20),
        });
        shutdown.register(Arc::new(Recorder {
            name: "stuck",
            delay: Duration::from_secs(5),
            log,
        }));

        let result = shutdown.execute("test").await;
        assert!(!result.success);
        assert_eq!(result.timed_out, vec!["stuck".to_string()]);
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }
}
