//! WebSocket Server
//!
//! Serves the delta stream at `/`. Each accepted socket is registered with the
//! connection registry, split into a reader loop (client requests) and a
//! writer task (draining the bounded outbound queue), and disconnected when
//! either side ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientRequest, Rejection, RequestError};
use crate::infrastructure::metrics;
use crate::infrastructure::registry::{ConnectionHandle, ConnectionRegistry};
use crate::infrastructure::transport::{ChannelSink, outbound_channel};

/// Time allowed for the close frame once the connection is torn down.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for the writer task to exit after teardown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Server
// =============================================================================

/// Delta stream WebSocket server.
pub struct WsServer {
    port: u16,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a new WebSocket server.
    #[must_use]
    pub const fn new(port: u16, registry: Arc<ConnectionRegistry>, cancel: CancellationToken) -> Self {
        Self {
            port,
            registry,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WsServerError` if binding fails or the server fails while
    /// running.
    pub async fn run(self) -> Result<(), WsServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WsServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WsServerError` if the server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), WsServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Delta WebSocket server listening");

        axum::serve(listener, router(self.registry))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| WsServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Delta WebSocket server stopped");
        Ok(())
    }
}

/// Build the WebSocket router.
pub fn router(registry: Arc<ConnectionRegistry>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(registry)
}

// =============================================================================
// Connection Handling
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<ConnectionRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut outbound) = outbound_channel(registry.poll_settings().outbound_capacity);
    let sink = Arc::new(sink);
    let handle = registry.connect(sink.clone());
    let closed = handle.closed().clone();

    let writer_closed = closed.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                () = writer_closed.cancelled() => break,
                frame = outbound.recv() => frame,
            };
            let Some(text) = frame else { break };

            // A peer that stops reading blocks the send; teardown must still win.
            let sent = tokio::select! {
                biased;
                () = writer_closed.cancelled() => break,
                sent = sender.send(Message::Text(text.into())) => sent,
            };
            if let Err(e) = sent {
                tracing::debug!(error = %e, "Socket write failed");
                break;
            }
        }
        let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sender.send(Message::Close(None))).await;
        writer_closed.cancel();
    });

    loop {
        let frame = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_text(&handle, &sink, text.as_str()),
            Some(Ok(Message::Binary(_))) => reject(&handle, &sink, &RequestError::UnsupportedFrame),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                tracing::debug!(connection = handle.id(), error = %e, "Socket read failed");
                break;
            }
        }
    }

    closed.cancel();
    drop(handle);
    match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Socket writer task failed"),
        Err(_) => {
            tracing::debug!("Socket writer did not stop, aborting");
            writer.abort();
        }
    }
}

fn handle_text(handle: &ConnectionHandle, sink: &ChannelSink, text: &str) {
    match ClientRequest::parse(text) {
        Ok(ClientRequest::Subscribe { instrument }) => {
            if let Err(e) = handle.subscribe(instrument) {
                tracing::warn!(connection = handle.id(), error = %e, "Subscribe failed");
                handle.closed().cancel();
            }
        }
        Err(e) => reject(handle, sink, &e),
    }
}

fn reject(handle: &ConnectionHandle, sink: &ChannelSink, err: &RequestError) {
    tracing::debug!(connection = handle.id(), code = err.code(), error = %err, "Rejecting request");
    metrics::record_rejected_request(err.code());
    if let Err(e) = sink.send_text(Rejection::from(err).to_json()) {
        metrics::record_transport_failure(e.reason());
        handle.closed().cancel();
    }
}

// =============================================================================
// Errors
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum WsServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
