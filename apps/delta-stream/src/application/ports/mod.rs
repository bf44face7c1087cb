//! Port Interfaces
//!
//! Contracts between the delta pipeline and its adapters, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `SourceStore`: time-range fetch against the data store
//! - `DeltaSink`: non-blocking push of a delta batch to one viewer
//!
//! ## Driver Ports (Inbound)
//!
//! - `DeltaProducer`: anything that yields one delta batch per tick. The
//!   watermark poller is the only implementation today; a push/notify
//!   producer can replace it without touching the merge engine or transport.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::source::Source;
use crate::domain::streaming::{DataPoint, DeltaBatch};

// =============================================================================
// Source Store
// =============================================================================

/// Data store error for a single fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The query failed.
    #[error("query for {key} failed: {message}")]
    Query {
        /// Source key.
        key: String,
        /// Driver error message.
        message: String,
    },
    /// The query did not complete in time.
    #[error("query for {key} timed out after {after:?}")]
    Timeout {
        /// Source key.
        key: String,
        /// Elapsed budget.
        after: Duration,
    },
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Uniform fetch contract over every registered source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch rows with time strictly greater than `after`, ordered by time
    /// ascending. Global sources ignore `instrument`.
    async fn fetch_since(
        &self,
        source: &Source,
        instrument: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

// =============================================================================
// Delta Producer
// =============================================================================

/// Yields one delta batch per invocation.
#[async_trait]
pub trait DeltaProducer: Send {
    /// Instrument the batches belong to.
    fn instrument(&self) -> &str;

    /// Produce the next batch. Never fails: per-source failures degrade to
    /// empty results.
    async fn next_batch(&mut self) -> DeltaBatch;

    /// Stop producing. Called once when the owning task exits.
    fn close(&mut self) {}
}

// =============================================================================
// Delta Sink
// =============================================================================

/// Outbound transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The batch could not be encoded.
    #[error("failed to encode delta: {0}")]
    Encode(#[from] serde_json::Error),
    /// The outbound buffer is full.
    #[error("outbound buffer full (slow consumer)")]
    SlowConsumer,
    /// The connection is gone.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Encode(_) => "encode",
            Self::SlowConsumer => "slow_consumer",
            Self::Closed => "closed",
        }
    }
}

/// Non-blocking delivery of delta batches to one connection.
pub trait DeltaSink: Send + Sync {
    /// Push a batch without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be encoded, the buffer is full,
    /// or the connection is closed. Any error tears the connection down.
    fn push(&self, batch: &DeltaBatch) -> Result<(), TransportError>;
}
