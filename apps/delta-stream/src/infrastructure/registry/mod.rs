//! Connection Registry
//!
//! Maps live viewer connections to their subscription and poll task.
//!
//! # Lifecycle
//!
//! - [`ConnectionRegistry::connect`] registers a connection with its outbound
//!   sink and returns a [`ConnectionHandle`]; dropping the handle disconnects.
//! - [`ConnectionRegistry::subscribe`] builds a fresh subscription (lookback
//!   watermarks) and starts its poll task, replacing any previous one.
//! - [`ConnectionRegistry::disconnect`] cancels the poll task before the
//!   subscription is dropped; any in-flight tick is abandoned.
//!
//! Every connection token is a child of the registry's root token, so
//! cancelling the root stops every poll task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{DeltaSink, SourceStore};
use crate::application::services::{PollTask, WatermarkPoller};
use crate::domain::source::SourceRegistry;
use crate::domain::subscription::{ConnectionId, Instrument, Subscription};
use crate::infrastructure::config::PollSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

struct ActiveSubscription {
    instrument: Instrument,
    subscribed_at: DateTime<Utc>,
    // Dropping the task cancels its loop.
    _task: PollTask,
}

struct ConnectionEntry {
    sink: Arc<dyn DeltaSink>,
    closed: CancellationToken,
    subscription: Option<ActiveSubscription>,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Open connections.
    pub connections: usize,
    /// Connections with an active subscription.
    pub subscriptions: usize,
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection is not (or no longer) registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

// =============================================================================
// Registry
// =============================================================================

/// Live connections and their poll tasks.
pub struct ConnectionRegistry {
    sources: Arc<SourceRegistry>,
    store: Arc<dyn SourceStore>,
    poll: PollSettings,
    root: CancellationToken,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Create a registry. Cancelling `root` stops every connection.
    #[must_use]
    pub fn new(
        sources: Arc<SourceRegistry>,
        store: Arc<dyn SourceStore>,
        poll: PollSettings,
        root: CancellationToken,
    ) -> Self {
        Self {
            sources,
            store,
            poll,
            root,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Poll settings in effect.
    #[must_use]
    pub const fn poll_settings(&self) -> &PollSettings {
        &self.poll
    }

    /// Register a connection.
    pub fn connect(self: &Arc<Self>, sink: Arc<dyn DeltaSink>) -> ConnectionHandle {
        let closed = self.root.child_token();
        let id = {
            let mut connections = self.connections.write();
            let id = loop {
                let (candidate, _) = uuid::Uuid::new_v4().as_u64_pair();
                if !connections.contains_key(&candidate) {
                    break candidate;
                }
            };
            connections.insert(
                id,
                ConnectionEntry {
                    sink,
                    closed: closed.clone(),
                    subscription: None,
                },
            );
            id
        };

        tracing::info!(connection = id, "Viewer connected");
        self.publish_gauges();

        ConnectionHandle {
            id,
            closed,
            registry: Arc::clone(self),
        }
    }

    /// Subscribe a connection to an instrument.
    ///
    /// Any previous subscription is torn down first; the new one starts from
    /// lookback watermarks and is polled immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn subscribe(&self, id: ConnectionId, instrument: Instrument) -> Result<(), RegistryError> {
        {
            let mut connections = self.connections.write();
            let entry = connections
                .get_mut(&id)
                .ok_or(RegistryError::UnknownConnection(id))?;

            let previous = entry.subscription.take();
            if let Some(previous) = &previous {
                tracing::info!(
                    connection = id,
                    from = %previous.instrument,
                    to = %instrument,
                    "Replacing subscription"
                );
            }
            drop(previous);

            let now = Utc::now();
            let subscription = Subscription::new(id, instrument.clone(), &self.sources, now);
            let poller =
                WatermarkPoller::new(subscription, Arc::clone(&self.sources), Arc::clone(&self.store));
            let task = PollTask::spawn(
                poller,
                Arc::clone(&entry.sink),
                self.poll.interval,
                entry.closed.child_token(),
                entry.closed.clone(),
            );

            tracing::info!(connection = id, instrument = %instrument, "Subscribed");
            entry.subscription = Some(ActiveSubscription {
                instrument,
                subscribed_at: now,
                _task: task,
            });
        }

        self.publish_gauges();
        Ok(())
    }

    /// Remove a connection and stop its poll task.
    ///
    /// Returns `false` if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().remove(&id);
        let Some(entry) = removed else {
            return false;
        };

        entry.closed.cancel();
        let instrument = entry
            .subscription
            .as_ref()
            .map(|s| s.instrument.to_string());
        drop(entry);

        tracing::info!(connection = id, instrument = ?instrument, "Viewer disconnected");
        self.publish_gauges();
        true
    }

    /// Instrument a connection is subscribed to.
    #[must_use]
    pub fn instrument_of(&self, id: ConnectionId) -> Option<Instrument> {
        self.connections
            .read()
            .get(&id)
            .and_then(|e| e.subscription.as_ref())
            .map(|s| s.instrument.clone())
    }

    /// When a connection's current subscription started.
    #[must_use]
    pub fn subscribed_at(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        self.connections
            .read()
            .get(&id)
            .and_then(|e| e.subscription.as_ref())
            .map(|s| s.subscribed_at)
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let connections = self.connections.read();
        RegistryStats {
            connections: connections.len(),
            subscriptions: connections
                .values()
                .filter(|e| e.subscription.is_some())
                .count(),
        }
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        metrics::set_connections(stats.connections);
        metrics::set_subscriptions(stats.subscriptions);
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

/// A registered connection. Dropping the handle disconnects it.
pub struct ConnectionHandle {
    id: ConnectionId,
    closed: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionHandle {
    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancelled when the connection must close (transport failure,
    /// disconnect or shutdown).
    #[must_use]
    pub const fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Subscribe this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection was already removed.
    pub fn subscribe(&self, instrument: Instrument) -> Result<(), RegistryError> {
        self.registry.subscribe(self.id, instrument)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.registry.disconnect(self.id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::StoreError;
    use crate::domain::source::Source;
    use crate::domain::streaming::DataPoint;
    use crate::infrastructure::transport::outbound_channel;

    struct EmptyStore;

    #[async_trait]
    impl SourceStore for EmptyStore {
        async fn fetch_since(
            &self,
            _source: &Source,
            _instrument: &str,
            _after: DateTime<Utc>,
        ) -> Result<Vec<DataPoint>, StoreError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn registry(root: CancellationToken) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Arc::new(SourceRegistry::standard()),
            Arc::new(EmptyStore),
            PollSettings {
                interval: Duration::from_secs(5),
                outbound_capacity: 8,
            },
            root,
        ))
    }

    fn instrument(name: &str) -> Instrument {
        Instrument::parse(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_polls_immediately() {
        let registry = registry(CancellationToken::new());
        let (sink, mut rx) = outbound_channel(8);
        let handle = registry.connect(Arc::new(sink));

        handle.subscribe(instrument("btc")).unwrap();

        let text = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["instrument"], "btc");
        assert_eq!(value.as_object().unwrap().len(), 7);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                connections: 1,
                subscriptions: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_replaces_task() {
        let registry = registry(CancellationToken::new());
        let (sink, mut rx) = outbound_channel(8);
        let handle = registry.connect(Arc::new(sink));

        handle.subscribe(instrument("btc")).unwrap();
        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["instrument"], "btc");

        handle.subscribe(instrument("eth")).unwrap();
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["instrument"], "eth");

        // Only the eth task keeps ticking.
        tokio::time::sleep(Duration::from_secs(11)).await;
        while let Ok(text) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["instrument"], "eth");
        }
        assert_eq!(registry.instrument_of(handle.id()), Some(instrument("eth")));
        assert_eq!(registry.stats().subscriptions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_disconnects() {
        let registry = registry(CancellationToken::new());
        let (sink, mut rx) = outbound_channel(8);
        let handle = registry.connect(Arc::new(sink));
        let closed = handle.closed().clone();
        handle.subscribe(instrument("btc")).unwrap();
        rx.recv().await.unwrap();

        drop(handle);

        assert!(closed.is_cancelled());
        assert_eq!(registry.stats(), RegistryStats::default());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_connection_rejected() {
        let registry = registry(CancellationToken::new());
        assert_eq!(
            registry.subscribe(42, instrument("btc")),
            Err(RegistryError::UnknownConnection(42))
        );
        assert!(!registry.disconnect(42));
    }

    #[tokio::test(start_paused = true)]
    async fn root_cancellation_closes_connections() {
        let root = CancellationToken::new();
        let registry = registry(root.clone());
        let (sink, _rx) = outbound_channel(8);
        let handle = registry.connect(Arc::new(sink));

        root.cancel();

        assert!(handle.closed().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_closes_connection() {
        let registry = registry(CancellationToken::new());
        let (sink, _rx) = outbound_channel(1);
        let handle = registry.connect(Arc::new(sink));

        handle.subscribe(instrument("btc")).unwrap();
        // First batch fills the queue; the second tick overflows it.
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(handle.closed().is_cancelled());
    }
}
