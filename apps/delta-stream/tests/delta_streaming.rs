//! Delta Streaming Integration Tests
//!
//! Runs the WebSocket server on a random port against an in-memory source
//! store and talks to it with a real WebSocket client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use delta_stream::{
    ClientConfig, ConnectionRegistry, DataPoint, Instrument, MergeKind, PollSettings,
    ReconnectSettings, Source, SourceMerge, SourceRegistry, SourceScope, SourceStore, StoreError,
    SyncClient, SyncEvent, WsServer,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Fixtures
// =============================================================================

/// Rows keyed by source, then instrument ("" for global sources).
#[derive(Default)]
struct TableStore {
    rows: Mutex<HashMap<(String, String), Vec<DataPoint>>>,
}

impl TableStore {
    fn insert(&self, source: &str, instrument: &str, point: DataPoint) {
        self.rows
            .lock()
            .entry((source.to_string(), instrument.to_string()))
            .or_default()
            .push(point);
    }
}

#[async_trait]
impl SourceStore for TableStore {
    async fn fetch_since(
        &self,
        source: &Source,
        instrument: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>, StoreError> {
        let scope = match source.scope() {
            SourceScope::PerInstrument => instrument,
            SourceScope::Global => "",
        };
        let rows = self.rows.lock();
        let mut points: Vec<_> = rows
            .get(&(source.key().to_string(), scope.to_string()))
            .map(|points| points.iter().filter(|p| p.time > after).cloned().collect())
            .unwrap_or_default();
        points.sort_by_key(|p| p.time);
        Ok(points)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct TestServer {
    url: String,
    registry: Arc<ConnectionRegistry>,
    store: Arc<TableStore>,
    cancel: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn point(age: TimeDelta, close: f64) -> DataPoint {
    DataPoint::at(Utc::now() - age).with_field("close", close)
}

async fn start_server() -> TestServer {
    let store = Arc::new(TableStore::default());
    store.insert("price", "btc", point(TimeDelta::hours(2), 100.0));
    store.insert("price", "btc", point(TimeDelta::hours(1), 101.0));
    store.insert("price", "btc", point(TimeDelta::days(30), 50.0));
    store.insert("price", "eth", point(TimeDelta::hours(1), 3000.0));
    store.insert("fear_greed", "", point(TimeDelta::days(2), 42.0));

    let dyn_store: Arc<dyn SourceStore> = store.clone();
    let poll = PollSettings {
        interval: Duration::from_millis(100),
        outbound_capacity: 64,
    };
    let (url, registry, cancel) = serve(dyn_store, poll).await;

    TestServer {
        url,
        registry,
        store,
        cancel,
    }
}

async fn serve(
    store: Arc<dyn SourceStore>,
    poll: PollSettings,
) -> (String, Arc<ConnectionRegistry>, CancellationToken) {
    let cancel = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(SourceRegistry::standard()),
        store,
        poll,
        cancel.clone(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WsServer::new(addr.port(), Arc::clone(&registry), cancel.clone());
    tokio::spawn(async move { server.serve(listener).await.unwrap() });

    (format!("ws://{addr}/"), registry, cancel)
}

async fn connect(server: &TestServer) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn closes(value: &Value, source: &str) -> Vec<f64> {
    value[source]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["close"].as_f64().unwrap())
        .collect()
}

// =============================================================================
// Server
// =============================================================================

#[tokio::test]
async fn first_delta_carries_every_source_within_lookback() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let delta = next_json(&mut ws).await;

    assert_eq!(delta["instrument"], "btc");
    for key in SourceRegistry::standard().keys() {
        assert!(delta[key].is_array(), "missing source {key}");
    }
    assert_eq!(closes(&delta, "price"), vec![100.0, 101.0]);
    assert_eq!(closes(&delta, "fear_greed"), vec![42.0]);
    assert!(delta["funding_data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn later_deltas_carry_only_new_rows() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let _initial = next_json(&mut ws).await;

    let quiet = next_json(&mut ws).await;
    assert!(closes(&quiet, "price").is_empty());

    server
        .store
        .insert("price", "btc", point(TimeDelta::seconds(1), 102.0));

    let delta = loop {
        let delta = next_json(&mut ws).await;
        if !closes(&delta, "price").is_empty() {
            break delta;
        }
    };
    assert_eq!(closes(&delta, "price"), vec![102.0]);
    assert!(closes(&delta, "fear_greed").is_empty());
}

#[tokio::test]
async fn malformed_request_is_rejected_and_connection_stays_open() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    send(&mut ws, "not json").await;
    let rejection = next_json(&mut ws).await;
    assert_eq!(rejection["error"], "malformed_json");

    send(&mut ws, r#"{"action":"unsubscribe","instrument":"btc"}"#).await;
    assert_eq!(next_json(&mut ws).await["error"], "unknown_action");

    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    assert_eq!(next_json(&mut ws).await["instrument"], "btc");
}

#[tokio::test]
async fn resubscribe_switches_instrument() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    assert_eq!(next_json(&mut ws).await["instrument"], "btc");

    send(&mut ws, r#"{"action":"subscribe","instrument":"eth"}"#).await;
    let delta = loop {
        let delta = next_json(&mut ws).await;
        if delta["instrument"] == "eth" {
            break delta;
        }
    };

    assert_eq!(closes(&delta, "price"), vec![3000.0]);
    // Global sources restart from their lookback on every subscription.
    assert_eq!(closes(&delta, "fear_greed"), vec![42.0]);
    assert_eq!(server.registry.stats().subscriptions, 1);
}

#[tokio::test]
async fn disconnect_releases_subscription() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let _ = next_json(&mut ws).await;
    assert_eq!(server.registry.stats().subscriptions, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let registry = Arc::clone(&server.registry);
    wait_until(move || registry.stats().connections == 0).await;
    assert_eq!(server.registry.stats().subscriptions, 0);
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let _ = next_json(&mut ws).await;

    server.cancel.cancel();

    let ended = timeout(WAIT, async {
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "connection not closed on shutdown");
}

#[tokio::test]
async fn resubscribe_same_instrument_restarts_from_lookback() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let initial = next_json(&mut ws).await;
    assert_eq!(closes(&initial, "price"), vec![100.0, 101.0]);
    let quiet = next_json(&mut ws).await;
    assert!(closes(&quiet, "price").is_empty());

    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;

    // A quiet tick from the replaced subscription may still be queued.
    let delta = loop {
        let delta = next_json(&mut ws).await;
        if !closes(&delta, "price").is_empty() {
            break delta;
        }
    };
    assert_eq!(delta["instrument"], "btc");
    assert_eq!(closes(&delta, "price"), vec![100.0, 101.0]);
    assert_eq!(closes(&delta, "fear_greed"), vec![42.0]);
    assert_eq!(server.registry.stats().subscriptions, 1);
}

/// Returns a fresh ~1 MiB price row on every fetch.
struct FloodStore;

#[async_trait]
impl SourceStore for FloodStore {
    async fn fetch_since(
        &self,
        source: &Source,
        _instrument: &str,
        _after: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>, StoreError> {
        if source.key() != "price" {
            return Ok(Vec::new());
        }
        Ok(vec![
            DataPoint::at(Utc::now()).with_field("blob", "x".repeat(1024 * 1024)),
        ])
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn stalled_reader_is_torn_down_completely() {
    let poll = PollSettings {
        interval: Duration::from_millis(10),
        outbound_capacity: 4,
    };
    let (url, registry, cancel) = serve(Arc::new(FloodStore), poll).await;
    let _shutdown = cancel.drop_guard();
    let baseline = Arc::strong_count(&registry);

    // Take the first delta, then never read again.
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send(&mut ws, r#"{"action":"subscribe","instrument":"btc"}"#).await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["instrument"], "btc");

    let watched = Arc::clone(&registry);
    wait_until(move || watched.stats().connections == 0).await;

    // The socket task holds a registry reference until it exits.
    let watched = Arc::clone(&registry);
    wait_until(move || Arc::strong_count(&watched) == baseline + 1).await;
    assert_eq!(Arc::strong_count(&registry), baseline);
    drop(ws);
}

// =============================================================================
// Sync Client
// =============================================================================

fn client_config(url: &str, instrument: &str) -> ClientConfig {
    ClientConfig {
        url: url.to_string(),
        instrument: instrument.to_string(),
        retention: None,
        liveness_timeout: Duration::from_secs(5),
        reconnect: ReconnectSettings {
            delay_initial: Duration::from_millis(10),
            delay_max: Duration::from_millis(50),
            delay_multiplier: 2.0,
            max_attempts: 0,
        },
    }
}

async fn next_merge(rx: &mut mpsc::Receiver<SyncEvent>, source: &str) -> SourceMerge {
    timeout(WAIT, async {
        loop {
            if let Some(SyncEvent::Merged(merge)) = rx.recv().await {
                if merge.source == source {
                    return merge;
                }
            }
        }
    })
    .await
    .expect("no merge event")
}

#[tokio::test]
async fn sync_client_initializes_then_appends() {
    let server = start_server().await;
    let (tx, mut rx) = mpsc::channel(256);
    let client = Arc::new(
        SyncClient::new(
            client_config(&server.url, "btc"),
            tx,
            server.cancel.child_token(),
        )
        .unwrap(),
    );
    tokio::spawn(Arc::clone(&client).run());

    let init = next_merge(&mut rx, "price").await;
    assert_eq!(init.kind, MergeKind::Initialized);
    assert_eq!(init.new_points, 2);
    assert_eq!(init.series_len, 2);

    server
        .store
        .insert("price", "btc", point(TimeDelta::seconds(1), 102.0));

    let appended = loop {
        let merge = next_merge(&mut rx, "price").await;
        assert_eq!(merge.kind, MergeKind::Incremental);
        if merge.new_points > 0 {
            break merge;
        }
    };
    assert_eq!(appended.new_points, 1);
    assert_eq!(appended.series_len, 3);

    let series = client.series("price");
    assert!(series.windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(series.last().unwrap().fields["close"], 102.0);
}

#[tokio::test]
async fn sync_client_switch_resets_store() {
    let server = start_server().await;
    let (tx, mut rx) = mpsc::channel(256);
    let client = Arc::new(
        SyncClient::new(
            client_config(&server.url, "btc"),
            tx,
            server.cancel.child_token(),
        )
        .unwrap(),
    );
    tokio::spawn(Arc::clone(&client).run());
    let _ = next_merge(&mut rx, "price").await;

    client.switch_instrument(Instrument::parse("eth").unwrap());

    let reset = timeout(WAIT, async {
        loop {
            if let Some(SyncEvent::Reset { instrument }) = rx.recv().await {
                return instrument;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reset, "eth");

    let init = loop {
        let merge = next_merge(&mut rx, "price").await;
        if merge.kind == MergeKind::Initialized {
            break merge;
        }
    };
    assert_eq!(init.series_len, 1);
    assert_eq!(client.series("price")[0].fields["close"], 3000.0);
}

#[tokio::test]
async fn sync_client_switch_to_current_instrument_keeps_store() {
    let server = start_server().await;
    let (tx, mut rx) = mpsc::channel(256);
    let client = Arc::new(
        SyncClient::new(
            client_config(&server.url, "btc"),
            tx,
            server.cancel.child_token(),
        )
        .unwrap(),
    );
    tokio::spawn(Arc::clone(&client).run());
    let init = next_merge(&mut rx, "price").await;
    assert_eq!(init.kind, MergeKind::Initialized);
    // The next tick's merge comes after the rest of the initial batch.
    let tick = next_merge(&mut rx, "price").await;
    assert_eq!(tick.kind, MergeKind::Incremental);

    client.switch_instrument(Instrument::parse("btc").unwrap());

    // Several ticks pass without a reset or a re-initialization.
    let mut events = Vec::new();
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    })
    .await;

    assert!(!events.is_empty());
    assert!(events.iter().all(|event| match event {
        SyncEvent::Reset { .. } => false,
        SyncEvent::Merged(merge) => merge.kind == MergeKind::Incremental && merge.new_points == 0,
        _ => true,
    }));
    assert_eq!(client.series("price").len(), 2);
}
