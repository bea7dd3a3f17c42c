//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::connection::{HealthCheck, HealthStatus, PoolHealthStats, PoolStats};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub broker: BrokerHealthResponse,
    pub pool: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealthResponse {
    pub address: String,
    pub status: String,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
}

/// GET /health - 200 when every pooled connection is up, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.queue.check_health().await;
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let PoolHealthStats {
        status,
        reconnection_attempts,
        total_reconnections,
        ..
    } = report.reconnects;

    (
        code,
        Json(HealthResponse {
            status: report.status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            broker: BrokerHealthResponse {
                address: state.queue.address().to_string(),
                status: status.as_str().to_string(),
                reconnection_attempts,
                total_reconnections,
            },
            pool: report.pool,
        }),
    )
}
