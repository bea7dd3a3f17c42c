//! Pool health tracking and the health check contract

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::{current_time_ms, ConnectionPool, PoolStats};

/// Reconnect state of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealthStatus {
    /// Every connection is connected
    Healthy,
    /// At least one connection is being replaced
    Reconnecting,
    /// The pool was closed
    Closed,
}

impl PoolHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealthStatus::Healthy => "healthy",
            PoolHealthStatus::Reconnecting => "reconnecting",
            PoolHealthStatus::Closed => "closed",
        }
    }
}

/// Lock-free reconnect counters shared by the pool and its maintenance task
pub struct PoolHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
    total_reconnections: AtomicU32,
}

impl PoolHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(PoolHealthStatus::Healthy as u8),
            last_connected: AtomicI64::new(current_time_ms()),
            reconnection_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
        }
    }

    /// A replacement session was established
    pub fn set_connected(&self) {
        self.status
            .store(PoolHealthStatus::Healthy as u8, Ordering::Release);
        self.last_connected
            .store(current_time_ms(), Ordering::Release);
        self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        self.reconnection_attempts.store(0, Ordering::Release);
    }

    /// A replacement attempt is starting
    pub fn set_reconnecting(&self) {
        self.status
            .store(PoolHealthStatus::Reconnecting as u8, Ordering::Release);
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_closed(&self) {
        self.status
            .store(PoolHealthStatus::Closed as u8, Ordering::Release);
    }

    pub fn status(&self) -> PoolHealthStatus {
        match self.status.load(Ordering::Acquire) {
            0 => PoolHealthStatus::Healthy,
            2 => PoolHealthStatus::Closed,
            _ => PoolHealthStatus::Reconnecting,
        }
    }

    pub fn stats(&self) -> PoolHealthStats {
        PoolHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
        }
    }
}

impl Default for PoolHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealthStats {
    pub status: PoolHealthStatus,
    pub last_connected_ms: i64,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
}

/// Result of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pool: PoolStats,
    pub reconnects: PoolHealthStats,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Connectivity probe consumed by hosting code
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self) -> HealthReport;
}

/// Liveness check over every pooled connection.
///
/// A single disconnected connection makes the whole pool unhealthy until the
/// reconnect loop has replaced it.
pub struct PoolHealthCheck {
    pool: Arc<ConnectionPool>,
}

impl PoolHealthCheck {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for PoolHealthCheck {
    async fn check_health(&self) -> HealthReport {
        let pool = self.pool.stats();
        let status = if pool.disconnected == 0 && !self.pool.is_closed() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        if status == HealthStatus::Unhealthy {
            tracing::warn!(
                disconnected = pool.disconnected,
                size = pool.size,
                "Connection pool unhealthy"
            );
        }

        HealthReport {
            status,
            pool,
            reconnects: self.pool.health().stats(),
        }
    }
}
