//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics;
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    // Pool size is sampled on scrape in addition to the collector updates
    metrics::POOL_SIZE.set(state.queue.stats().size as i64);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::response::Response;

    use crate::broker::InMemoryBroker;
    use crate::client::PersistentQueue;
    use crate::config::{PersistentQueueOptions, Settings};
    use crate::metrics::NoopMetrics;

    #[tokio::test]
    async fn test_metrics_endpoint_ok() {
        let broker = InMemoryBroker::new();
        let queue = PersistentQueue::connect(
            Arc::new(broker),
            PersistentQueueOptions::default(),
            Arc::new(NoopMetrics),
        )
        .await
        .unwrap();
        let state = AppState::new(Settings::default(), queue);

        let response: Response = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[axum::http::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
