//! Delta Stream Server Binary
//!
//! Serves watermark-based market data deltas over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin delta-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL`: Postgres connection URL
//!
//! ## Optional
//! - `DELTA_STREAM_WS_PORT`: WebSocket port (default: 5001)
//! - `DELTA_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `DELTA_STREAM_POLL_INTERVAL_SECS`: Poll period (default: 5)
//! - `DELTA_STREAM_OUTBOUND_CAPACITY`: Per-connection queue size (default: 64)
//! - `DELTA_STREAM_DB_MAX_CONNECTIONS`: Pool size (default: 10)
//! - `DELTA_STREAM_DB_MIN_CONNECTIONS`: Idle pool connections (default: 1)
//! - `DELTA_STREAM_DB_ACQUIRE_TIMEOUT_SECS`: Pool acquire timeout (default: 30)
//! - `DELTA_STREAM_QUERY_TIMEOUT_SECS`: Per-source query timeout (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: delta-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use delta_stream::application::ports::SourceStore;
use delta_stream::infrastructure::health::{HealthServer, HealthServerState};
use delta_stream::infrastructure::registry::ConnectionRegistry;
use delta_stream::infrastructure::telemetry;
use delta_stream::infrastructure::websocket::WsServer;
use delta_stream::{PgSourceStore, SourceRegistry, StreamConfig, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init("delta-stream");

    tracing::info!("Starting Delta Stream");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = StreamConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Data store and source table registry
    let pg_store = PgSourceStore::connect(&config.database).await?;
    let store: Arc<dyn SourceStore> = Arc::new(pg_store.clone());
    let sources = Arc::new(SourceRegistry::standard());
    tracing::info!(sources = sources.len(), "Source registry loaded");

    // Connection registry owns one poll task per subscribed connection
    let registry = Arc::new(ConnectionRegistry::new(
        sources,
        Arc::clone(&store),
        config.poll.clone(),
        shutdown_token.clone(),
    ));

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
        Arc::clone(&store),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn WebSocket server
    let ws_server = WsServer::new(
        config.server.ws_port,
        Arc::clone(&registry),
        shutdown_token.clone(),
    );
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    tracing::info!("Delta stream ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = ws_handle.await;
        let _ = health_handle.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Servers did not stop within the shutdown timeout");
    }

    pg_store.close().await;
    tracing::info!("Delta stream stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        poll_interval_ms = config.poll.interval.as_millis(),
        outbound_capacity = config.poll.outbound_capacity,
        "Configuration loaded"
    );
    tracing::debug!(database = ?config.database, "Database settings");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
