//! Sync Client
//!
//! WebSocket client that subscribes to one instrument, feeds every delta
//! frame into a [`SyncStore`], and reports merges as [`SyncEvent`]s.
//!
//! Every (re)connection is a cold start: the subscribe request is resent and
//! the store is cleared, so the first batch on the new connection
//! re-initializes each source from the server's lookback window.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::liveness::{LivenessConfig, LivenessEvent, LivenessMonitor, LivenessState};
use super::reconnect::ReconnectPolicy;
use crate::domain::streaming::DataPoint;
use crate::domain::subscription::{Instrument, InstrumentError};
use crate::domain::sync::{ApplyOutcome, IgnoreReason, SourceMerge, SyncStore};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::websocket::{ClientRequest, Rejection, ServerMessage};

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the sync client.
#[derive(Debug, thiserror::Error)]
pub enum SyncClientError {
    /// Configured instrument is invalid.
    #[error("invalid instrument: {0}")]
    InvalidInstrument(#[from] InstrumentError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// No frame arrived within the liveness timeout.
    #[error("connection silent for longer than the liveness timeout")]
    LivenessExpired,

    /// Server closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connected and subscribed.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Reconnecting after disconnect.
    Reconnecting {
        /// Attempt number.
        attempt: u32,
    },
    /// Store cleared for a (re)subscription.
    Reset {
        /// Subscribed instrument.
        instrument: String,
    },
    /// One source merged from a delta batch.
    Merged(SourceMerge),
    /// A delta batch was discarded.
    Ignored(IgnoreReason),
    /// The server rejected a request.
    Rejected(Rejection),
}

// =============================================================================
// Sync Client
// =============================================================================

/// Delta stream client driving a [`SyncStore`].
pub struct SyncClient {
    config: ClientConfig,
    store: RwLock<SyncStore>,
    instrument: watch::Sender<Instrument>,
    event_tx: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
}

impl SyncClient {
    /// Create a client for `config.instrument`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncClientError::InvalidInstrument`] if the configured
    /// instrument is not a valid instrument identifier.
    pub fn new(
        config: ClientConfig,
        event_tx: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, SyncClientError> {
        let instrument = Instrument::parse(&config.instrument)?;
        let store = config
            .retention
            .map_or_else(SyncStore::new, |horizon| SyncStore::new().with_retention(horizon));

        Ok(Self {
            config,
            store: RwLock::new(store),
            instrument: watch::Sender::new(instrument),
            event_tx,
            cancel,
        })
    }

    /// Currently requested instrument.
    #[must_use]
    pub fn instrument(&self) -> Instrument {
        self.instrument.borrow().clone()
    }

    /// Switch to another instrument. Takes effect on the live connection
    /// immediately, or on the next connection if disconnected. Switching to
    /// the instrument already subscribed is a no-op and keeps the store.
    pub fn switch_instrument(&self, instrument: Instrument) {
        self.instrument.send_replace(instrument);
    }

    /// Run `f` against the sync store.
    pub fn with_store<R>(&self, f: impl FnOnce(&SyncStore) -> R) -> R {
        f(&self.store.read())
    }

    /// Copy of a source's merged history.
    #[must_use]
    pub fn series(&self, source: &str) -> Vec<DataPoint> {
        self.store.read().series(source).to_vec()
    }

    /// Run the connection loop until cancelled or out of reconnect attempts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncClientError::MaxReconnectAttemptsExceeded`] once the
    /// reconnect policy gives up.
    pub async fn run(self: Arc<Self>) -> Result<(), SyncClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Sync client cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut policy).await {
                Ok(()) => {
                    tracing::info!("Sync client stopped");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Delta stream connection error");
                    let _ = self.event_tx.send(SyncEvent::Disconnected).await;

                    let Some(delay) = policy.next_delay() else {
                        return Err(SyncClientError::MaxReconnectAttemptsExceeded(
                            policy.max_attempts(),
                        ));
                    };
                    let attempt = policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to delta stream"
                    );
                    let _ = self.event_tx.send(SyncEvent::Reconnecting { attempt }).await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Sync client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, subscribe, and process frames until error or cancellation.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), SyncClientError> {
        tracing::info!(url = %self.config.url, "Connecting to delta stream");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();
        policy.reset();

        let mut instrument_rx = self.instrument.subscribe();
        let mut current = instrument_rx.borrow_and_update().clone();
        self.subscribe(&mut write, &current).await?;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let liveness = Arc::new(LivenessState::new());
        let (liveness_tx, mut liveness_rx) = mpsc::channel(4);
        let liveness_cancel = self.cancel.child_token();
        let _liveness_guard = liveness_cancel.clone().drop_guard();
        tokio::spawn(
            LivenessMonitor::new(
                LivenessConfig::from_timeout(self.config.liveness_timeout),
                Arc::clone(&liveness),
                liveness_tx,
                liveness_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                changed = instrument_rx.changed() => {
                    if changed.is_ok() {
                        let requested = instrument_rx.borrow_and_update().clone();
                        if requested == current {
                            tracing::debug!(instrument = %current, "Already subscribed, keeping store");
                        } else {
                            self.subscribe(&mut write, &requested).await?;
                            current = requested;
                        }
                    }
                }
                event = liveness_rx.recv() => {
                    match event {
                        Some(LivenessEvent::SendPing) => {
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        Some(LivenessEvent::Expired) => {
                            return Err(SyncClientError::LivenessExpired);
                        }
                        None => {}
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            liveness.record();
                            self.handle_text(text.as_str()).await;
                        }
                        Some(Ok(Message::Pong(_))) => liveness.record(),
                        Some(Ok(Message::Ping(data))) => {
                            liveness.record();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SyncClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Send a subscribe request and reset the store.
    async fn subscribe<W>(&self, write: &mut W, instrument: &Instrument) -> Result<(), SyncClientError>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        write
            .send(Message::Text(ClientRequest::subscribe(instrument.clone()).to_json().into()))
            .await?;
        self.store.write().subscribe(instrument.as_str());

        tracing::info!(instrument = %instrument, "Subscribed to delta stream");
        let _ = self
            .event_tx
            .send(SyncEvent::Reset {
                instrument: instrument.as_str().to_string(),
            })
            .await;
        Ok(())
    }

    async fn handle_text(&self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable server frame");
                return;
            }
        };

        match message {
            ServerMessage::Delta(batch) => {
                let outcome = self.store.write().apply(batch);
                match outcome {
                    ApplyOutcome::Applied(merges) => {
                        for merge in merges {
                            tracing::debug!(
                                source = %merge.source,
                                kind = ?merge.kind,
                                new_points = merge.new_points,
                                series_len = merge.series_len,
                                "Merged delta"
                            );
                            let _ = self.event_tx.send(SyncEvent::Merged(merge)).await;
                        }
                    }
                    ApplyOutcome::Ignored(reason) => {
                        tracing::debug!(reason = ?reason, "Ignored delta");
                        let _ = self.event_tx.send(SyncEvent::Ignored(reason)).await;
                    }
                }
            }
            ServerMessage::Rejected(rejection) => {
                tracing::warn!(
                    error = %rejection.error,
                    reason = %rejection.reason,
                    "Request rejected by server"
                );
                let _ = self.event_tx.send(SyncEvent::Rejected(rejection)).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
