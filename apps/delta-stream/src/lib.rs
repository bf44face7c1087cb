#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Delta Stream - Watermark-Based Market Data Streaming
//!
//! A WebSocket service that pushes only the rows each viewer has not seen
//! yet, plus a client that merges those deltas into duplicate-free history.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core delta streaming types and merge logic
//!   - `source`: Registered time-series tables and lookbacks
//!   - `streaming`: Data points and delta batches
//!   - `subscription`: Per-connection instrument and watermarks
//!   - `sync`: Client-side dedup merge store
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Interfaces for the data store, producers and transport
//!   - `services`: Watermark poller and cancellable poll task
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `postgres`: `sqlx` source store
//!   - `registry`: Connection to subscription bookkeeping
//!   - `websocket`: axum WebSocket server and wire protocol
//!   - `transport`: Bounded per-connection outbound queue
//!   - `client`: Reconnecting sync client
//!   - `config`, `health`, `metrics`, `telemetry`: Ambient services
//!
//! # Data Flow
//!
//! ```text
//!  Postgres ──► WatermarkPoller ──► PollTask ──► outbound queue ──► WebSocket
//!                  (per tick,        (per          (bounded,            │
//!                   per source)       connection)   try_send)           ▼
//!                                                               SyncClient ──► SyncStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core delta streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::source::{Source, SourceRegistry, SourceScope};
pub use domain::streaming::{DataPoint, DeltaBatch, SourceDelta};
pub use domain::subscription::{ConnectionId, Instrument, Subscription, Watermarks};
pub use domain::sync::{ApplyOutcome, IgnoreReason, MergeKind, SourceMerge, SourcePhase, SyncStore};

// Ports and services
pub use application::ports::{DeltaProducer, DeltaSink, SourceStore, StoreError, TransportError};
pub use application::services::{PollExit, PollTask, WatermarkPoller};

// Infrastructure config
pub use infrastructure::config::{
    ClientConfig, ConfigError, DatabaseSettings, PollSettings, ReconnectSettings, ServerSettings,
    StreamConfig,
};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::registry::{ConnectionHandle, ConnectionRegistry, RegistryError};
pub use infrastructure::websocket::{WsServer, WsServerError};

// Client
pub use infrastructure::client::{SyncClient, SyncClientError, SyncEvent};

// Store
pub use infrastructure::postgres::PgSourceStore;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
