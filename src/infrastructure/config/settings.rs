use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub queue: PersistentQueueOptions,
    #[serde(default)]
    pub consumer: ConsumerDefaults,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

/// Which broker driver to use and where it lives
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Driver kind: "memory" or "redis"
    #[serde(default = "default_broker_kind")]
    pub kind: String,
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Approximate cap on entries kept per Redis stream
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
    /// Idle time before an unacked Redis entry is claimed for redelivery
    #[serde(default = "default_redelivery_idle_ms")]
    pub redelivery_idle_ms: u64,
    /// Liveness `PING` cadence of each Redis session
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

/// Pool sizing and lifecycle options, read-only after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistentQueueOptions {
    /// Connections kept open even when idle
    #[serde(default = "default_pool_min_size")]
    pub pool_min_size: usize,
    /// Hard upper bound on open connections
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,
    /// How long `acquire` waits for a free connection
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Interval of the idle-connection prune pass
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    /// Interval of the disconnected-connection replacement pass
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Idle connections older than this are pruned
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
    /// Consumer group joined by every consumer
    #[serde(default = "default_consumer_group_name")]
    pub consumer_group_name: String,
    /// Prepended to every message-type subject (e.g. "prod.")
    #[serde(default)]
    pub subject_prefix: String,
    /// Prefix of ephemeral reply subjects
    #[serde(default = "default_reply_subject_prefix")]
    pub reply_subject_prefix: String,
}

/// Defaults applied to consumers that don't override them
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerDefaults {
    /// Parallel dispatch loops per consumer
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the bounded inbound buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Acknowledge only after the callback succeeded
    #[serde(default = "default_manual_ack")]
    pub manual_ack: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_broker_kind() -> String {
    "memory".to_string()
}

fn default_broker_url() -> String {
    "memory://local".to_string()
}

fn default_stream_max_len() -> usize {
    10_000
}

fn default_redelivery_idle_ms() -> u64 {
    30_000
}

fn default_ping_interval_ms() -> u64 {
    5_000
}

fn default_pool_min_size() -> usize {
    1
}

fn default_pool_max_size() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_prune_interval_ms() -> u64 {
    60_000 // 1 minute
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

fn default_idle_time_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_consumer_group_name() -> String {
    "default".to_string()
}

fn default_reply_subject_prefix() -> String {
    "_INBOX".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_buffer_size() -> usize {
    100
}

fn default_manual_ack() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-persistent-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("broker.kind", default_broker_kind())?
            .set_default("broker.url", default_broker_url())?
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // PQ__BROKER__URL, PQ__QUEUE__POOL_MAX_SIZE, PQ__CONSUMER__WORKERS, ...
            .add_source(
                Environment::with_prefix("PQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.consumer.validate()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl PersistentQueueOptions {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }

    /// Subject a message type is published on
    pub fn subject_for(&self, message_type: &str) -> String {
        format!("{}{}", self.subject_prefix, message_type)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_max_size == 0 {
            return Err(ConfigError::Message(
                "queue.pool_max_size must be at least 1".to_string(),
            ));
        }
        if self.pool_min_size > self.pool_max_size {
            return Err(ConfigError::Message(format!(
                "queue.pool_min_size ({}) exceeds queue.pool_max_size ({})",
                self.pool_min_size, self.pool_max_size
            )));
        }
        if self.prune_interval_ms == 0 || self.reconnect_interval_ms == 0 {
            return Err(ConfigError::Message(
                "queue prune and reconnect intervals must be positive".to_string(),
            ));
        }
        if self.consumer_group_name.is_empty() {
            return Err(ConfigError::Message(
                "queue.consumer_group_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConsumerDefaults {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.buffer_size == 0 {
            return Err(ConfigError::Message(
                "consumer.workers and consumer.buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            url: default_broker_url(),
            stream_max_len: default_stream_max_len(),
            redelivery_idle_ms: default_redelivery_idle_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl Default for PersistentQueueOptions {
    fn default() -> Self {
        Self {
            pool_min_size: default_pool_min_size(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            prune_interval_ms: default_prune_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            idle_time_ms: default_idle_time_ms(),
            consumer_group_name: default_consumer_group_name(),
            subject_prefix: String::new(),
            reply_subject_prefix: default_reply_subject_prefix(),
        }
    }
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            manual_ack: default_manual_ack(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let queue = PersistentQueueOptions::default();
        assert_eq!(queue.pool_min_size, 1);
        assert_eq!(queue.pool_max_size, 10);
        assert_eq!(queue.connection_timeout(), Duration::from_secs(5));
        assert_eq!(queue.reply_subject_prefix, "_INBOX");

        let server = ServerConfig::default();
        assert_eq!(server.port, 8082);

        let broker = BrokerConfig::default();
        assert_eq!(broker.stream_max_len, 10_000);
        assert_eq!(broker.redelivery_idle_ms, 30_000);
        assert_eq!(broker.ping_interval_ms, 5_000);
    }

    #[test]
    fn test_min_above_max_rejected() {
        let queue = PersistentQueueOptions {
            pool_min_size: 5,
            pool_max_size: 2,
            ..PersistentQueueOptions::default()
        };
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let consumer = ConsumerDefaults {
            workers: 0,
            ..ConsumerDefaults::default()
        };
        assert!(consumer.validate().is_err());
    }

    #[test]
    fn test_subject_prefix() {
        let queue = PersistentQueueOptions {
            subject_prefix: "prod.".to_string(),
            ..PersistentQueueOptions::default()
        };
        assert_eq!(queue.subject_for("order.created"), "prod.order.created");
    }

    #[test]
    fn test_deserialize_partial_queue_section() {
        let queue: PersistentQueueOptions =
            serde_json::from_str(r#"{"pool_max_size": 2, "consumer_group_name": "billing"}"#)
                .unwrap();
        assert_eq!(queue.pool_max_size, 2);
        assert_eq!(queue.pool_min_size, 1);
        assert_eq!(queue.consumer_group_name, "billing");
    }
}
