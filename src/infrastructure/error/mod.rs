use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Error, Debug)]
pub enum QueueError {
    /// No connection became available within the connection timeout
    #[error("Connection pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    /// The connector's current session is gone and no replacement exists yet
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The consumer buffer was full; the message is left for redelivery
    #[error("Buffer overflow: {0}")]
    BufferOverflow(String),

    /// A consumer callback failed
    #[error("Processing error: {0}")]
    Processing(String),

    /// No reply arrived on the reply subject in time
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope type tag does not match the expected message type
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Operation not allowed in the component's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl QueueError {
    /// Stable code used in logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::PoolExhausted(_) => "POOL_EXHAUSTED",
            QueueError::ConnectionLost(_) => "CONNECTION_LOST",
            QueueError::BufferOverflow(_) => "BUFFER_OVERFLOW",
            QueueError::Processing(_) => "PROCESSING_ERROR",
            QueueError::RequestTimeout(_) => "REQUEST_TIMEOUT",
            QueueError::Broker(_) => "BROKER_ERROR",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
            QueueError::TypeMismatch { .. } => "TYPE_MISMATCH",
            QueueError::InvalidState(_) => "INVALID_STATE",
            QueueError::InvalidOptions(_) => "INVALID_OPTIONS",
            QueueError::PoolClosed => "POOL_CLOSED",
            QueueError::Config(_) => "CONFIG_ERROR",
            QueueError::Metrics(_) => "METRICS_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            QueueError::PoolExhausted(_)
            | QueueError::ConnectionLost(_)
            | QueueError::Broker(_)
            | QueueError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            QueueError::InvalidOptions(_) | QueueError::TypeMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            QueueError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let log_message = self.to_string();
        let client_message = if is_production() && status.is_server_error() {
            "Service temporarily unavailable".to_string()
        } else {
            log_message.clone()
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
