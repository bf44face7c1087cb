//! Poll Task
//!
//! Drives a [`DeltaProducer`] on a fixed cadence and pushes every batch to a
//! [`DeltaSink`]. The first tick fires immediately; ticks never overlap.
//!
//! The task is tied to its connection through two tokens: its own `cancel`
//! token (cancelled when the [`PollTask`] is dropped) and a `teardown` token
//! it cancels when the sink fails, which closes the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::application::ports::{DeltaProducer, DeltaSink, TransportError};
use crate::infrastructure::metrics;

/// Why a poll task stopped.
#[derive(Debug)]
pub enum PollExit {
    /// Cancelled by the owner (resubscribe, disconnect or shutdown).
    Cancelled,
    /// The sink rejected a batch; the connection was torn down.
    TransportFailed(TransportError),
}

/// Handle to a running poll loop. Dropping it cancels the loop.
pub struct PollTask {
    token: CancellationToken,
    guard: DropGuard,
    handle: JoinHandle<PollExit>,
}

impl PollTask {
    /// Spawn a poll loop.
    pub fn spawn<P>(
        producer: P,
        sink: Arc<dyn DeltaSink>,
        period: Duration,
        cancel: CancellationToken,
        teardown: CancellationToken,
    ) -> Self
    where
        P: DeltaProducer + 'static,
    {
        let handle = tokio::spawn(run(producer, sink, period, cancel.clone(), teardown));
        Self {
            token: cancel.clone(),
            guard: cancel.drop_guard(),
            handle,
        }
    }

    /// Request the loop to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit on its own.
    pub async fn join(self) -> PollExit {
        let Self { guard, handle, .. } = self;
        let exit = handle.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Poll task panicked");
            PollExit::Cancelled
        });
        drop(guard);
        exit
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) -> PollExit {
        self.cancel();
        self.join().await
    }
}

async fn run<P: DeltaProducer>(
    mut producer: P,
    sink: Arc<dyn DeltaSink>,
    period: Duration,
    cancel: CancellationToken,
    teardown: CancellationToken,
) -> PollExit {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        instrument = producer.instrument(),
        period_ms = period.as_millis(),
        "Poll task started"
    );

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break PollExit::Cancelled,
            _ = interval.tick() => {}
        }

        // An in-flight tick is abandoned on cancellation; watermarks it
        // already advanced are kept.
        let batch = tokio::select! {
            biased;
            () = cancel.cancelled() => break PollExit::Cancelled,
            batch = producer.next_batch() => batch,
        };

        if cancel.is_cancelled() {
            break PollExit::Cancelled;
        }

        match sink.push(&batch) {
            Ok(()) => metrics::record_message_sent(),
            Err(e) => {
                tracing::warn!(
                    instrument = producer.instrument(),
                    error = %e,
                    "Delta push failed, closing connection"
                );
                metrics::record_transport_failure(e.reason());
                teardown.cancel();
                break PollExit::TransportFailed(e);
            }
        }
    };

    producer.close();
    tracing::debug!(instrument = producer.instrument(), exit = ?exit, "Poll task stopped");
    exit
}

// =============================================================================
// Tests
// =============================================================================
