//! Broker driver factory

use std::sync::Arc;
use std::time::Duration;

use crate::config::BrokerConfig;

use super::{BrokerDriver, BrokerError, InMemoryBroker, RedisStreamsDriver};

/// Create a broker driver based on configuration.
///
/// - `"redis"`: `RedisStreamsDriver` connected to `url`
/// - `"memory"`: a fresh `InMemoryBroker` addressed by `url`
///
/// # Example
///
/// ```rust,ignore
/// let driver = create_driver(&settings.broker)?;
/// let queue = PersistentQueue::connect(driver, settings.queue.clone(), metrics).await?;
/// ```
pub fn create_driver(config: &BrokerConfig) -> Result<Arc<dyn BrokerDriver>, BrokerError> {
    match config.kind.as_str() {
        "redis" => {
            tracing::info!(broker = "redis", url = %config.url, "Creating Redis streams driver");
            let driver = RedisStreamsDriver::new(&config.url)?
                .with_max_len(config.stream_max_len)
                .with_redelivery_idle(Duration::from_millis(config.redelivery_idle_ms))
                .with_ping_interval(Duration::from_millis(config.ping_interval_ms));
            Ok(Arc::new(driver))
        }
        "memory" => {
            tracing::info!(broker = "memory", address = %config.url, "Creating in-memory broker");
            Ok(Arc::new(InMemoryBroker::with_address(config.url.clone())))
        }
        other => Err(BrokerError::UnsupportedKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_driver() {
        let driver = create_driver(&BrokerConfig::default()).unwrap();
        assert_eq!(driver.address(), "memory://local");
    }

    #[test]
    fn test_redis_driver() {
        let config = BrokerConfig {
            kind: "redis".to_string(),
            url: "redis://localhost:6379".to_string(),
            ..BrokerConfig::default()
        };
        let driver = create_driver(&config).unwrap();
        assert_eq!(driver.address(), "redis://localhost:6379");
    }

    #[test]
    fn test_unknown_kind() {
        let config = BrokerConfig {
            kind: "kafka".to_string(),
            url: String::new(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            create_driver(&config),
            Err(BrokerError::UnsupportedKind(kind)) if kind == "kafka"
        ));
    }
}
