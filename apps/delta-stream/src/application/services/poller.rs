//! Watermark Poller
//!
//! Per-subscription producer: each tick queries every registered source for
//! rows newer than its watermark, advances the watermark to the newest row
//! returned, and assembles one delta batch.
//!
//! Sources are queried sequentially in registration order, which caps the
//! number of in-flight queries a single connection can generate at one. A
//! failing source contributes an empty array and keeps its watermark; the
//! other sources are unaffected.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::application::ports::{DeltaProducer, SourceStore};
use crate::domain::source::{Source, SourceRegistry};
use crate::domain::streaming::{DataPoint, DeltaBatch};
use crate::domain::subscription::Subscription;
use crate::infrastructure::metrics;

/// Polls every source for one subscription.
pub struct WatermarkPoller {
    subscription: Subscription,
    sources: Arc<SourceRegistry>,
    store: Arc<dyn SourceStore>,
}

impl WatermarkPoller {
    /// Create a poller owning `subscription`.
    #[must_use]
    pub fn new(
        subscription: Subscription,
        sources: Arc<SourceRegistry>,
        store: Arc<dyn SourceStore>,
    ) -> Self {
        Self {
            subscription,
            sources,
            store,
        }
    }

    /// The polled subscription.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Run one tick.
    ///
    /// The returned batch carries every registered source key, in
    /// registration order, even when no rows were found. A closed
    /// subscription yields an empty batch without touching the store.
    pub async fn tick(&mut self) -> DeltaBatch {
        let mut batch = DeltaBatch::new(self.subscription.instrument().as_str());
        if !self.subscription.is_active() {
            return batch;
        }

        let started = Instant::now();
        let sources = Arc::clone(&self.sources);
        for source in sources.iter() {
            let points = self.fetch(source).await;
            batch.push(source.key(), points);
        }
        metrics::record_tick(started.elapsed());

        tracing::trace!(
            connection = self.subscription.connection(),
            batch = %batch,
            "Poll tick complete"
        );
        batch
    }

    async fn fetch(&mut self, source: &Source) -> Vec<DataPoint> {
        let Some(after) = self.subscription.watermark(source.key()) else {
            return Vec::new();
        };

        let instrument = self.subscription.instrument().as_str();
        match self.store.fetch_since(source, instrument, after).await {
            Ok(mut rows) => {
                rows.retain(|p| p.time > after);
                rows.sort_by_key(|p| p.time);
                if let Some(last) = rows.last() {
                    self.subscription.advance(source.key(), last.time);
                }
                metrics::record_rows_fetched(source.key(), rows.len());
                rows
            }
            Err(e) => {
                tracing::warn!(
                    connection = self.subscription.connection(),
                    instrument = %self.subscription.instrument(),
                    source = source.key(),
                    error = %e,
                    "Source query failed, sending empty result"
                );
                metrics::record_source_failure(source.key(), e.kind());
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DeltaProducer for WatermarkPoller {
    fn instrument(&self) -> &str {
        self.subscription.instrument().as_str()
    }

    async fn next_batch(&mut self) -> DeltaBatch {
        self.tick().await
    }

    fn close(&mut self) {
        self.subscription.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
