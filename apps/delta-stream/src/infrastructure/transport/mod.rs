//! Outbound Transport
//!
//! Bounded per-connection outbound queue. The poll task encodes each batch
//! once and `try_send`s the text frame; the socket writer drains the queue.
//! A full queue means the viewer is not keeping up and is treated as a
//! transport failure rather than a reason to block the poller.

use tokio::sync::mpsc;

use crate::application::ports::{DeltaSink, TransportError};
use crate::domain::streaming::DeltaBatch;

/// Create a bounded outbound queue of encoded frames.
#[must_use]
pub fn outbound_channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink::new(tx), rx)
}

/// [`DeltaSink`] over a bounded `mpsc` queue of JSON text frames.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    /// Wrap an existing sender.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queue an already-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SlowConsumer`] if the queue is full or
    /// [`TransportError::Closed`] if the receiver is gone.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DeltaSink for ChannelSink {
    fn push(&self, batch: &DeltaBatch) -> Result<(), TransportError> {
        let text = serde_json::to_string(batch)?;
        self.send_text(text)
    }
}
