use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use ara_persistent_queue::broker::create_driver;
use ara_persistent_queue::config::Settings;
use ara_persistent_queue::consumer::ConsumerOptions;
use ara_persistent_queue::metrics::PrometheusMetricsCollector;
use ara_persistent_queue::server::{create_app, AppState};
use ara_persistent_queue::shutdown::GracefulShutdown;
use ara_persistent_queue::telemetry::init_telemetry;
use ara_persistent_queue::{Message, PersistentQueue};

/// Connectivity probe request
#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    sent_at_ms: i64,
}

impl Message for Ping {
    fn message_type() -> &'static str {
        "Ping"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    sent_at_ms: i64,
    responder: String,
}

impl Message for Pong {
    fn message_type() -> &'static str {
        "Pong"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(broker = %settings.broker.kind, "Configuration loaded");

    // Connect the queue
    let driver = create_driver(&settings.broker)?;
    let metrics = Arc::new(PrometheusMetricsCollector::new());
    let queue = PersistentQueue::connect(driver, settings.queue.clone(), metrics).await?;
    tracing::info!(address = %queue.address(), "Queue connected");

    // Ping responder
    let responder = Arc::new(
        queue
            .consumer::<Ping>(ConsumerOptions::from(settings.consumer.clone()))
            .await?,
    );
    let responder_name = settings.otel.service_name.clone();
    responder
        .run_with_response(move |ping: Ping, _context| {
            let responder = responder_name.clone();
            async move {
                let pong = Pong {
                    sent_at_ms: ping.sent_at_ms,
                    responder,
                };
                (true, Some(pong))
            }
        })
        .await?;

    // Round trip through the broker once at startup
    probe(&queue).await;

    let mut shutdown = GracefulShutdown::new();
    shutdown.register(responder).register(queue.clone());

    // Create Axum app
    let app = create_app(AppState::new(settings.clone(), queue));

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_signal_handler(stop.clone()));

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await?;

    let result = shutdown.execute("signal received").await;
    if !result.success {
        tracing::warn!(timed_out = ?result.timed_out, "Shutdown incomplete");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn probe(queue: &PersistentQueue) {
    let producer = match queue.producer::<Ping>().await {
        Ok(producer) => producer,
        Err(e) => {
            tracing::warn!(error = %e, "Startup probe skipped");
            return;
        }
    };

    let ping = Ping {
        sent_at_ms: chrono::Utc::now().timestamp_millis(),
    };
    match producer.request::<Pong>(&ping, Duration::from_secs(5)).await {
        Ok(pong) => tracing::info!(
            responder = %pong.responder,
            round_trip_ms = chrono::Utc::now().timestamp_millis() - pong.sent_at_ms,
            "Startup probe answered"
        ),
        Err(e) => tracing::warn!(error = %e, "Startup probe failed"),
    }
}

async fn shutdown_signal_handler(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    stop.cancel();
}
