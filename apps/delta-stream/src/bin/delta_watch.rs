//! Delta Watch Binary
//!
//! Subscribes to a delta stream and logs each merge as the sync store
//! applies it.
//!
//! # Usage
//!
//! ```bash
//! DELTA_WATCH_INSTRUMENT=eth cargo run --bin delta-watch
//! ```
//!
//! # Environment Variables
//!
//! - `DELTA_STREAM_URL`: Server URL (default: `ws://127.0.0.1:5001/`)
//! - `DELTA_WATCH_INSTRUMENT`: Instrument to follow (default: btc)
//! - `DELTA_WATCH_RETENTION_HOURS`: History bound (default: unbounded)
//! - `DELTA_WATCH_LIVENESS_TIMEOUT_SECS`: Silence before reconnect (default: 20)
//! - `DELTA_WATCH_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `DELTA_WATCH_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `DELTA_WATCH_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `DELTA_WATCH_RECONNECT_MAX_ATTEMPTS`: Attempts before giving up (default: 0, unlimited)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use delta_stream::infrastructure::telemetry;
use delta_stream::{ClientConfig, MergeKind, SyncClient, SyncEvent};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let _telemetry_guard = telemetry::init("delta-watch");

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = ClientConfig::from_env()?;
    tracing::info!(
        url = %config.url,
        instrument = %config.instrument,
        retention_hours = config.retention.map(|r| r.num_hours()),
        "Starting delta watch"
    );

    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(256);
    let client = Arc::new(SyncClient::new(config, event_tx, cancel.clone())?);

    let events = tokio::spawn(log_events(event_rx, Arc::clone(&client)));

    let mut run = tokio::spawn(Arc::clone(&client).run());

    let outcome = tokio::select! {
        result = &mut run => result?,
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Signal handler failed");
            }
            tracing::info!("Received Ctrl+C, stopping");
            cancel.cancel();
            run.await?
        }
    };
    events.abort();

    outcome?;
    tracing::info!("Delta watch stopped");
    Ok(())
}

/// Log sync events as they arrive.
async fn log_events(mut rx: mpsc::Receiver<SyncEvent>, client: Arc<SyncClient>) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Connected => tracing::info!("Connected"),
            SyncEvent::Disconnected => tracing::warn!("Disconnected"),
            SyncEvent::Reconnecting { attempt } => tracing::info!(attempt, "Reconnecting"),
            SyncEvent::Reset { instrument } => {
                tracing::info!(instrument = %instrument, "Store reset for subscription");
            }
            SyncEvent::Merged(merge) => {
                let newest = client
                    .with_store(|store| store.series(&merge.source).last().map(|p| p.time));
                match merge.kind {
                    MergeKind::Initialized => tracing::info!(
                        source = %merge.source,
                        points = merge.series_len,
                        newest = ?newest,
                        "Series initialized"
                    ),
                    MergeKind::Incremental if merge.new_points > 0 => tracing::info!(
                        source = %merge.source,
                        new_points = merge.new_points,
                        series_len = merge.series_len,
                        newest = ?newest,
                        "Series extended"
                    ),
                    MergeKind::Incremental => {}
                }
            }
            SyncEvent::Ignored(reason) => tracing::debug!(reason = ?reason, "Delta ignored"),
            SyncEvent::Rejected(rejection) => tracing::warn!(
                error = %rejection.error,
                reason = %rejection.reason,
                "Request rejected"
            ),
        }
    }
}
