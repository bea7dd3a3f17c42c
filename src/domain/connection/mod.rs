//! Broker connection management
//!
//! This module provides:
//! - `Connection`: one broker session with take/release bookkeeping
//! - `ConnectionPool`: bounded pool with prune and reconnect maintenance
//! - `Connector`: a lease on a pooled connection that follows reconnects
//! - `PoolHealthCheck`: liveness probe over the pool

mod connector;
mod handle;
mod health;
mod pool;

pub use connector::Connector;
pub use handle::{Connection, ListenerId, ReconnectListener, Registration};
pub use health::{
    HealthCheck, HealthReport, HealthStatus, PoolHealth, PoolHealthCheck, PoolHealthStats,
    PoolHealthStatus,
};
pub use pool::{ConnectionPool, PoolStats};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
