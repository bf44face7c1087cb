//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (pings the data store)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SourceStore;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::registry::ConnectionRegistry;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy" or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Data store status.
    pub store: StoreStatus,
    /// Viewer connection counts.
    pub connections: ConnectionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// The data store is unreachable.
    Unhealthy,
}

/// Data store status.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Whether the last ping succeeded.
    pub reachable: bool,
    /// Ping error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Viewer connection counts.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Open WebSocket connections.
    pub open: usize,
    /// Connections with an active subscription.
    pub subscribed: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn SourceStore>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn SourceStore>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            registry,
            store,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "READY"),
        Err(e) => {
            tracing::debug!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let store = match state.store.ping().await {
        Ok(()) => StoreStatus {
            reachable: true,
            error: None,
        },
        Err(e) => StoreStatus {
            reachable: false,
            error: Some(e.to_string()),
        },
    };
    let stats = state.registry.stats();

    HealthResponse {
        status: determine_health_status(&store),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        store,
        connections: ConnectionStatus {
            open: stats.connections,
            subscribed: stats.subscriptions,
        },
    }
}

const fn determine_health_status(store: &StoreStatus) -> HealthStatus {
    if store.reachable {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{MockSourceStore, StoreError};
    use crate::domain::source::SourceRegistry;
    use crate::infrastructure::config::PollSettings;

    fn state(reachable: bool) -> Arc<HealthServerState> {
        let mut store = MockSourceStore::new();
        store.expect_ping().returning(move || {
            if reachable {
                Ok(())
            } else {
                Err(StoreError::Unavailable("connection refused".to_string()))
            }
        });
        let store: Arc<dyn SourceStore> = Arc::new(store);
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(SourceRegistry::standard()),
            Arc::clone(&store),
            PollSettings {
                interval: Duration::from_secs(5),
                outbound_capacity: 8,
            },
            CancellationToken::new(),
        ));
        Arc::new(HealthServerState::new("0.1.0".to_string(), registry, store))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[tokio::test]
    async fn health_reports_store_and_connections() {
        let (status, body) = get(state(true), "/health").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["store"]["reachable"], true);
        assert!(value["store"].get("error").is_none());
        assert_eq!(value["connections"]["open"], 0);
        assert_eq!(value["connections"]["subscribed"], 0);
    }

    #[tokio::test]
    async fn health_unhealthy_when_store_down() {
        let (status, body) = get(state(false), "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(
            value["store"]["error"],
            "store unavailable: connection refused"
        );
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (status, body) = get(state(false), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readiness_follows_store_ping() {
        assert_eq!(get(state(true), "/readyz").await, (StatusCode::OK, "READY".to_string()));
        assert_eq!(
            get(state(false), "/readyz").await,
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY".to_string())
        );
    }
}
