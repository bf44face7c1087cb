//! Connection Liveness
//!
//! The server pushes one frame per poll tick, so a silent socket means a dead
//! connection. The monitor pings periodically and reports expiry once no
//! inbound frame (delta, rejection, or pong) has arrived within the timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Liveness timing.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Interval between pings (and expiry checks).
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl LivenessConfig {
    /// Ping at a quarter of `timeout`.
    #[must_use]
    pub fn from_timeout(timeout: Duration) -> Self {
        Self {
            ping_interval: (timeout / 4).max(Duration::from_millis(10)),
            timeout,
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Send a ping frame.
    SendPing,
    /// Nothing received within the timeout.
    Expired,
}

/// Last inbound activity, shared between the socket reader and the monitor.
#[derive(Debug)]
pub struct LivenessState {
    last_seen: RwLock<Instant>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// State marked as seen now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound activity.
    pub fn record(&self) {
        *self.last_seen.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_seen.read().elapsed()
    }
}

/// Periodic ping and expiry check for one connection.
pub struct LivenessMonitor {
    config: LivenessConfig,
    state: Arc<LivenessState>,
    event_tx: mpsc::Sender<LivenessEvent>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: LivenessConfig,
        state: Arc<LivenessState>,
        event_tx: mpsc::Sender<LivenessEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, expired, or the event receiver is dropped.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Liveness monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let idle = self.state.idle();
                    let event = if idle > self.config.timeout {
                        tracing::warn!(
                            idle_ms = idle.as_millis(),
                            timeout_ms = self.config.timeout.as_millis(),
                            "Connection silent past liveness timeout"
                        );
                        LivenessEvent::Expired
                    } else {
                        LivenessEvent::SendPing
                    };

                    if self.event_tx.send(event).await.is_err() || event == LivenessEvent::Expired {
                        break;
                    }
                }
            }
        }
    }
}
